//! In-memory subscription store for local development and tests

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DueCursor, SubscriptionStore};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::Subscription;

/// Per-user history; the last entry is the current record
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    records: RwLock<HashMap<Uuid, Vec<Subscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let records = self.records.read().await;
        Ok(records.get(&user_id).and_then(|h| h.last()).cloned())
    }

    async fn insert(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut records = self.records.write().await;
        let history = records.entry(subscription.user_id()).or_default();
        if history.iter().any(|s| s.is_live()) {
            return Err(BillingError::ConcurrentModification(subscription.user_id()));
        }
        history.push(subscription.clone());
        Ok(subscription.clone())
    }

    async fn compare_and_swap(&self, next: &Subscription) -> BillingResult<Option<Subscription>> {
        let mut records = self.records.write().await;
        let Some(stored) = records
            .get_mut(&next.user_id())
            .and_then(|h| h.iter_mut().find(|s| s.id() == next.id()))
        else {
            return Err(BillingError::NoActiveSubscription(next.user_id()));
        };

        if stored.version() != next.version() {
            return Ok(None);
        }

        *stored = next.clone().with_version(next.version() + 1);
        Ok(Some(stored.clone()))
    }

    async fn due_for_rollover(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let records = self.records.read().await;
        let mut due: Vec<Subscription> = records
            .values()
            .flat_map(|h| h.iter())
            .filter(|s| s.is_due(now))
            .filter(|s| after.is_none_or(|cursor| DueCursor::of(s) > cursor))
            .cloned()
            .collect();
        due.sort_by_key(DueCursor::of);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        let records = self.records.read().await;
        let mut all: Vec<Subscription> = records.values().flat_map(|h| h.iter()).cloned().collect();
        all.sort_by_key(|s| s.created_at());
        Ok(all)
    }
}
