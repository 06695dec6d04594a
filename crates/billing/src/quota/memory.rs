//! In-memory quota counters
//!
//! The whole check-and-increment runs while holding one mutex, so concurrent
//! callers for the same key are strictly serialized.

use std::collections::HashMap;

use async_trait::async_trait;
use time::Date;
use tokio::sync::Mutex;

use super::{ConsumeOutcome, QuotaKey, QuotaStore};
use crate::error::BillingResult;

#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    counters: Mutex<HashMap<QuotaKey, u32>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_consume(
        &self,
        key: &QuotaKey,
        amount: u32,
        limit: u32,
    ) -> BillingResult<ConsumeOutcome> {
        let mut counters = self.counters.lock().await;
        let used = counters.get(key).copied().unwrap_or(0);

        match used.checked_add(amount) {
            Some(next) if next <= limit => {
                counters.insert(*key, next);
                Ok(ConsumeOutcome::Consumed { used: next })
            }
            _ => Ok(ConsumeOutcome::Rejected { used }),
        }
    }

    async fn used(&self, key: &QuotaKey) -> BillingResult<u32> {
        let counters = self.counters.lock().await;
        Ok(counters.get(key).copied().unwrap_or(0))
    }

    async fn prune_before(&self, day: Date) -> BillingResult<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|key, _| key.day >= day);
        Ok((before - counters.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabuscope_shared::ResourceKind;
    use std::sync::Arc;
    use time::macros::date;
    use uuid::Uuid;

    fn key(day: Date) -> QuotaKey {
        QuotaKey {
            user_id: Uuid::new_v4(),
            resource: ResourceKind::ApiCall,
            day,
        }
    }

    #[tokio::test]
    async fn test_consume_up_to_limit_then_reject() {
        let store = InMemoryQuotaStore::new();
        let k = key(date!(2025 - 06 - 10));

        assert_eq!(
            store.try_consume(&k, 2, 3).await.unwrap(),
            ConsumeOutcome::Consumed { used: 2 }
        );
        assert_eq!(
            store.try_consume(&k, 2, 3).await.unwrap(),
            ConsumeOutcome::Rejected { used: 2 }
        );
        assert_eq!(
            store.try_consume(&k, 1, 3).await.unwrap(),
            ConsumeOutcome::Consumed { used: 3 }
        );
        assert_eq!(store.used(&k).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_without_creating_counter() {
        let store = InMemoryQuotaStore::new();
        let k = key(date!(2025 - 06 - 10));
        assert_eq!(
            store.try_consume(&k, 1, 0).await.unwrap(),
            ConsumeOutcome::Rejected { used: 0 }
        );
        assert_eq!(store.prune_before(date!(2030 - 01 - 01)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_overshoot() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let k = key(date!(2025 - 06 - 10));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_consume(&k, 1, 20).await.unwrap()
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ConsumeOutcome::Consumed { .. }) {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 20);
        assert_eq!(store.used(&k).await.unwrap(), 20);
    }
}
