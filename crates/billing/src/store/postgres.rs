//! Postgres subscription store
//!
//! Optimistic locking uses the `version` column: every write is an
//! `UPDATE ... WHERE id = $1 AND version = $2` that bumps the version, so a
//! lost race shows up as zero affected rows.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DueCursor, SubscriptionStore};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{PendingChange, Subscription, SubscriptionParts};

const SELECT_COLUMNS: &str = r#"
    id, user_id, plan_id, status, current_period_start, current_period_end,
    billing_anchor_day, pending_target_plan_id, pending_effective_at, pending_kind,
    pending_requested_at, cancel_reason, cancelled_at, needs_review, review_note,
    version, created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    billing_anchor_day: i16,
    pending_target_plan_id: Option<String>,
    pending_effective_at: Option<OffsetDateTime>,
    pending_kind: Option<String>,
    pending_requested_at: Option<OffsetDateTime>,
    cancel_reason: Option<String>,
    cancelled_at: Option<OffsetDateTime>,
    needs_review: bool,
    review_note: Option<String>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let pending_change = match (row.pending_target_plan_id, row.pending_effective_at, row.pending_kind) {
            (Some(target_plan_id), Some(effective_at), Some(kind)) => Some(PendingChange {
                target_plan_id,
                effective_at,
                kind: kind.parse()?,
                requested_at: row.pending_requested_at.unwrap_or(row.updated_at),
            }),
            (None, None, None) => None,
            _ => {
                return Err(BillingError::Database(format!(
                    "subscription {} has a partially written pending change",
                    row.id
                )))
            }
        };

        let billing_anchor_day = u8::try_from(row.billing_anchor_day).map_err(|_| {
            BillingError::Database(format!(
                "subscription {} has invalid anchor day {}",
                row.id, row.billing_anchor_day
            ))
        })?;

        Ok(Subscription::from_parts(SubscriptionParts {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            billing_anchor_day,
            pending_change,
            cancel_reason: row.cancel_reason,
            cancelled_at: row.cancelled_at,
            needs_review: row.needs_review,
            review_note: row.review_note,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn insert(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let pending = subscription.pending_change();
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan_id, status, current_period_start, current_period_end,
                billing_anchor_day, pending_target_plan_id, pending_effective_at, pending_kind,
                pending_requested_at, cancel_reason, cancelled_at, needs_review, review_note,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(subscription.id())
        .bind(subscription.user_id())
        .bind(subscription.plan_id())
        .bind(subscription.status().as_str())
        .bind(subscription.current_period_start())
        .bind(subscription.current_period_end())
        .bind(i16::from(subscription.billing_anchor_day()))
        .bind(pending.map(|p| p.target_plan_id.clone()))
        .bind(pending.map(|p| p.effective_at))
        .bind(pending.map(|p| p.kind.as_str()))
        .bind(pending.map(|p| p.requested_at))
        .bind(subscription.cancel_reason())
        .bind(subscription.cancelled_at())
        .bind(subscription.needs_review())
        .bind(subscription.review_note())
        .bind(subscription.version())
        .bind(subscription.created_at())
        .bind(subscription.updated_at())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(subscription.clone()),
            // subscriptions_one_live_per_user
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                BillingError::ConcurrentModification(subscription.user_id()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_swap(&self, next: &Subscription) -> BillingResult<Option<Subscription>> {
        let pending = next.pending_change();
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                pending_target_plan_id = $7,
                pending_effective_at = $8,
                pending_kind = $9,
                pending_requested_at = $10,
                cancel_reason = $11,
                cancelled_at = $12,
                needs_review = $13,
                review_note = $14,
                updated_at = $15,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(next.id())
        .bind(next.version())
        .bind(next.plan_id())
        .bind(next.status().as_str())
        .bind(next.current_period_start())
        .bind(next.current_period_end())
        .bind(pending.map(|p| p.target_plan_id.clone()))
        .bind(pending.map(|p| p.effective_at))
        .bind(pending.map(|p| p.kind.as_str()))
        .bind(pending.map(|p| p.requested_at))
        .bind(next.cancel_reason())
        .bind(next.cancelled_at())
        .bind(next.needs_review())
        .bind(next.review_note())
        .bind(next.updated_at())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn due_for_rollover(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status <> 'cancelled'
              AND current_period_end <= $1
              AND ($2::timestamptz IS NULL OR (current_period_end, id) > ($2::timestamptz, $3::uuid))
            ORDER BY current_period_end ASC, id ASC
            LIMIT $4
            "#,
            SELECT_COLUMNS
        ))
        .bind(now)
        .bind(after.map(|c| c.period_end))
        .bind(after.map(|c| c.id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}
