//! Subscription persistence
//!
//! Writes are optimistic: a record is read, a new state is derived from it,
//! and [`SubscriptionStore::compare_and_swap`] persists that state only if
//! nobody else has written since the read. Losers re-read and retry.

mod memory;
mod postgres;

pub use memory::InMemorySubscriptionStore;
pub use postgres::PgSubscriptionStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::subscriptions::Subscription;

/// Keyset position in the due list: the last `(current_period_end, id)` seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub period_end: OffsetDateTime,
    pub id: Uuid,
}

impl DueCursor {
    pub fn of(subscription: &Subscription) -> Self {
        Self {
            period_end: subscription.current_period_end(),
            id: subscription.id(),
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Most recent record for the user, live or cancelled
    async fn current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Insert a new record. Fails with `ConcurrentModification` if the user
    /// already has a live one.
    async fn insert(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Persist `next` if the stored version still equals `next.version()`.
    ///
    /// Returns the stored record (version bumped) or `None` on a lost race.
    async fn compare_and_swap(&self, next: &Subscription) -> BillingResult<Option<Subscription>>;

    /// Live records whose period ended at or before `now`, ordered by
    /// `(current_period_end, id)` and starting strictly after `after`
    async fn due_for_rollover(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Every record, oldest first
    async fn list_all(&self) -> BillingResult<Vec<Subscription>>;
}
