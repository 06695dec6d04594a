//! Postgres quota counters
//!
//! One statement does the insert-or-increment and the limit check. When the
//! `WHERE` clause of the conflict branch fails no row is returned and the
//! counter is left untouched.

use async_trait::async_trait;
use sqlx::PgPool;
use time::Date;

use super::{ConsumeOutcome, QuotaKey, QuotaStore};
use crate::error::BillingResult;

pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn try_consume(
        &self,
        key: &QuotaKey,
        amount: u32,
        limit: u32,
    ) -> BillingResult<ConsumeOutcome> {
        let amount = i64::from(amount);
        let limit = i64::from(limit);

        // A single request larger than the whole allowance never touches the table
        if amount > limit {
            let used = self.used(key).await?;
            return Ok(ConsumeOutcome::Rejected { used });
        }

        let consumed: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO quota_counters (user_id, resource_kind, window_day, used, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, resource_kind, window_day)
            DO UPDATE SET used = quota_counters.used + EXCLUDED.used,
                          updated_at = NOW()
            WHERE quota_counters.used + EXCLUDED.used <= $5
            RETURNING used
            "#,
        )
        .bind(key.user_id)
        .bind(key.resource.as_str())
        .bind(key.day)
        .bind(amount)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        match consumed {
            Some(used) => Ok(ConsumeOutcome::Consumed {
                used: u32::try_from(used).unwrap_or(0),
            }),
            None => {
                let used = self.used(key).await?;
                Ok(ConsumeOutcome::Rejected { used })
            }
        }
    }

    async fn used(&self, key: &QuotaKey) -> BillingResult<u32> {
        let used: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT used FROM quota_counters
            WHERE user_id = $1 AND resource_kind = $2 AND window_day = $3
            "#,
        )
        .bind(key.user_id)
        .bind(key.resource.as_str())
        .bind(key.day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(used.and_then(|u| u32::try_from(u).ok()).unwrap_or(0))
    }

    async fn prune_before(&self, day: Date) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM quota_counters WHERE window_day < $1")
            .bind(day)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabuscope_shared::{create_pool, run_migrations, ResourceKind};
    use std::sync::Arc;
    use time::macros::date;
    use uuid::Uuid;

    async fn store() -> PgQuotaStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        PgQuotaStore::new(pool)
    }

    fn key(day: Date) -> QuotaKey {
        QuotaKey {
            user_id: Uuid::new_v4(),
            resource: ResourceKind::AiAnalysis,
            day,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres - run with: DATABASE_URL=... cargo test -- --ignored
    async fn test_conditional_upsert_stops_at_limit() {
        let store = store().await;
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
    #[ignore] // Requires Postgres - run with: DATABASE_URL=... cargo test -- --ignored
    async fn test_concurrent_upserts_never_overshoot() {
        let store = Arc::new(store().await);
        let k = key(date!(2025 - 06 - 11));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_consume(&k, 1, 15).await.unwrap()
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ConsumeOutcome::Consumed { .. }) {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 15);
        assert_eq!(store.used(&k).await.unwrap(), 15);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres - run with: DATABASE_URL=... cargo test -- --ignored
    async fn test_oversized_request_leaves_no_row() {
        let store = store().await;
        let k = key(date!(2025 - 06 - 12));

        assert_eq!(
            store.try_consume(&k, 5, 3).await.unwrap(),
            ConsumeOutcome::Rejected { used: 0 }
        );
        assert_eq!(store.used(&k).await.unwrap(), 0);
    }
}
