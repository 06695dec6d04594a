//! Billing Period Clock
//!
//! Out-of-band sweep over subscriptions whose period has ended. For each one
//! it applies a pending change that has come due, then rolls the period
//! forward contiguously until it covers `now`. Cancelled records are frozen.
//!
//! The due check and the write happen against the same record version, so
//! two overlapping sweeps, or a sweep racing a user transition, cannot roll a
//! period twice or apply a pending change that was just withdrawn. Running
//! the sweep again with the same `now` finds nothing due.
//!
//! Daily quota windows need no work here: counters are keyed by UTC day.

use std::sync::Arc;
use std::time::Duration;

use kabuscope_shared::SharedClock;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::intents::{BillingIntent, IntentAction, SharedIntentSink};
use crate::store::{DueCursor, SubscriptionStore};

const DEFAULT_BATCH_SIZE: i64 = 500;
const CONFLICT_RETRIES: usize = 4;

/// Totals from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    #[serde(with = "time::serde::rfc3339::option")]
    pub now: Option<OffsetDateTime>,
    /// Due records looked at
    pub examined: u32,
    /// Records whose period moved forward
    pub rolled: u32,
    /// Sum of periods moved across all records
    pub periods_rolled: u32,
    pub changes_applied: u32,
    pub cancelled: u32,
    /// Records marked for manual review
    pub flagged: u32,
    /// Records skipped after repeated version conflicts
    pub conflicts: u32,
    pub errors: u32,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        self.conflicts > 0 || self.errors > 0
    }
}

/// What happened to one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
enum SettleOutcome {
    /// Already settled by someone else
    NotDue,
    Settled {
        periods_rolled: u32,
        applied: bool,
        cancelled: bool,
        flagged: bool,
    },
}

pub struct BillingPeriodClock {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    clock: SharedClock,
    intents: SharedIntentSink,
    batch_size: i64,
}

impl BillingPeriodClock {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        clock: SharedClock,
        intents: SharedIntentSink,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            intents,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sweep at the clock's current time
    pub async fn sweep_now(&self) -> BillingResult<SweepReport> {
        self.sweep(self.clock.now()).await
    }

    /// Settle every subscription due at `now`
    pub async fn sweep(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let mut report = SweepReport {
            now: Some(now),
            ..SweepReport::default()
        };
        let mut cursor = None;

        tracing::info!(now = %now, "Billing period sweep started");

        loop {
            let batch = self
                .store
                .due_for_rollover(now, cursor, self.batch_size)
                .await?;
            let batch_len = batch.len();
            let Some(last) = batch.last() else {
                break;
            };
            // Records that fail stay due; paging past them keeps the rest reachable
            cursor = Some(DueCursor::of(last));

            for subscription in batch {
                report.examined += 1;
                let user_id = subscription.user_id();
                let subscription_id = subscription.id();

                match self.settle_with_retry(user_id, subscription_id, now).await {
                    Ok(SettleOutcome::NotDue) => {}
                    Ok(SettleOutcome::Settled {
                        periods_rolled,
                        applied,
                        cancelled,
                        flagged,
                    }) => {
                        if periods_rolled > 0 {
                            report.rolled += 1;
                            report.periods_rolled += periods_rolled;
                        }
                        report.changes_applied += u32::from(applied);
                        report.cancelled += u32::from(cancelled);
                        report.flagged += u32::from(flagged);
                    }
                    Err(e) if e.is_conflict() => {
                        tracing::warn!(
                            user_id = %user_id,
                            subscription_id = %subscription_id,
                            "Sweep gave up on subscription after version conflicts"
                        );
                        report.conflicts += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            user_id = %user_id,
                            subscription_id = %subscription_id,
                            error = %e,
                            "Failed to settle subscription"
                        );
                        report.errors += 1;
                    }
                }
            }

            if i64::try_from(batch_len).unwrap_or(i64::MAX) < self.batch_size {
                break;
            }
        }

        tracing::info!(
            examined = report.examined,
            rolled = report.rolled,
            periods_rolled = report.periods_rolled,
            changes_applied = report.changes_applied,
            cancelled = report.cancelled,
            flagged = report.flagged,
            conflicts = report.conflicts,
            errors = report.errors,
            "Billing period sweep finished"
        );

        Ok(report)
    }

    async fn settle_with_retry(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<SettleOutcome> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(200))
            .map(jitter)
            .take(CONFLICT_RETRIES);

        RetryIf::start(
            strategy,
            || self.settle_once(user_id, subscription_id, now),
            |e: &BillingError| e.is_conflict(),
        )
        .await
    }

    /// Re-read, settle and write back in one versioned step
    async fn settle_once(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<SettleOutcome> {
        let current = match self.store.current(user_id).await? {
            Some(s) if s.id() == subscription_id => s,
            _ => return Ok(SettleOutcome::NotDue),
        };

        let Some(settlement) = current.settle(&self.catalog, now)? else {
            return Ok(SettleOutcome::NotDue);
        };

        let Some(stored) = self.store.compare_and_swap(&settlement.next).await? else {
            return Err(BillingError::ConcurrentModification(user_id));
        };

        if let Some(note) = &settlement.flagged {
            tracing::error!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                plan_id = %stored.plan_id(),
                note = %note,
                "Subscription flagged for manual review"
            );
        }

        if let Some(applied) = &settlement.applied {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                from_plan_id = %applied.from_plan_id,
                to_plan_id = %applied.to_plan_id,
                kind = %applied.kind,
                cancelled = applied.cancelled,
                effective_at = %applied.effective_at,
                "Scheduled plan change applied"
            );

            let action = if applied.cancelled {
                IntentAction::Cancellation
            } else {
                IntentAction::ScheduledChangeApplied
            };
            self.intents.emit(BillingIntent {
                intent_id: Uuid::new_v4(),
                user_id,
                subscription_id,
                action,
                from_plan_id: applied.from_plan_id.clone(),
                to_plan_id: applied.to_plan_id.clone(),
                effective_at: applied.effective_at,
                current_period_end: stored.current_period_end(),
                reason: stored.cancel_reason().map(str::to_string),
                created_at: now,
            });
        }

        if settlement.periods_rolled > 0 {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                periods_rolled = settlement.periods_rolled,
                period_start = %stored.current_period_start(),
                period_end = %stored.current_period_end(),
                "Billing period rolled over"
            );
        }

        Ok(SettleOutcome::Settled {
            periods_rolled: settlement.periods_rolled,
            applied: settlement.applied.is_some(),
            cancelled: settlement.applied.as_ref().is_some_and(|a| a.cancelled),
            flagged: settlement.flagged.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::{ChannelIntentSink, LogIntentSink};
    use crate::store::InMemorySubscriptionStore;
    use crate::subscriptions::{EffectiveDate, SubscriptionStatus, TransitionRequest};
    use crate::transitions::TransitionEngine;
    use kabuscope_shared::{Clock, ManualClock};
    use time::macros::datetime;

    struct Harness {
        engine: TransitionEngine,
        sweeper: BillingPeriodClock,
        clock: Arc<ManualClock>,
    }

    fn harness(start: OffsetDateTime) -> Harness {
        let clock = Arc::new(ManualClock::new(start));
        let store: Arc<dyn SubscriptionStore> = Arc::new(InMemorySubscriptionStore::new());
        let catalog = Arc::new(PlanCatalog::builtin());
        let engine = TransitionEngine::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            Arc::new(LogIntentSink),
        );
        let sweeper = BillingPeriodClock::new(store, catalog, clock.clone(), Arc::new(LogIntentSink));
        Harness {
            engine,
            sweeper,
            clock,
        }
    }

    #[tokio::test]
    async fn test_sweep_before_period_end_does_nothing() {
        let h = harness(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        h.engine.register(user_id).await.unwrap();

        let report = h.sweeper.sweep(datetime!(2025-03-31 23:59 UTC)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.rolled, 0);
    }

    #[tokio::test]
    async fn test_sweep_rolls_plain_subscription() {
        let h = harness(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        h.engine.register(user_id).await.unwrap();

        h.clock.set(datetime!(2025-04-01 00:00 UTC));
        let report = h.sweeper.sweep_now().await.unwrap();
        assert_eq!(report.rolled, 1);
        assert_eq!(report.periods_rolled, 1);

        let sub = h.engine.get_current(user_id).await.unwrap();
        assert_eq!(sub.current_period_start(), datetime!(2025-04-01 00:00 UTC));
        assert_eq!(sub.current_period_end(), datetime!(2025-05-01 00:00 UTC));
    }

    #[tokio::test]
    async fn test_sweep_completes_pending_cancellation() {
        let h = harness(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        h.engine.register(user_id).await.unwrap();
        h.engine.upgrade(user_id, "pro").await.unwrap();
        let request = TransitionRequest::cancellation(
            user_id,
            h.clock.now(),
            EffectiveDate::EndOfPeriod,
            Some("budget".to_string()),
        );
        h.engine.cancel(user_id, request).await.unwrap();

        let report = h.sweeper.sweep(datetime!(2025-04-01 00:00 UTC)).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.rolled, 0);

        let sub = h.engine.get_current(user_id).await.unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Cancelled);
        assert_eq!(sub.plan_id(), "free");
        assert_eq!(sub.current_period_end(), datetime!(2025-04-01 00:00 UTC));

        // Frozen: later sweeps leave it alone
        let later = h.sweeper.sweep(datetime!(2025-07-01 00:00 UTC)).await.unwrap();
        assert_eq!(later.examined, 0);
    }

    #[tokio::test]
    async fn test_sweep_emits_intent_for_applied_change() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 00:00 UTC)));
        let store: Arc<dyn SubscriptionStore> = Arc::new(InMemorySubscriptionStore::new());
        let catalog = Arc::new(PlanCatalog::builtin());
        let (sink, mut rx) = ChannelIntentSink::channel(16);
        let engine = TransitionEngine::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            Arc::new(LogIntentSink),
        );
        let sweeper = BillingPeriodClock::new(store, catalog, clock, Arc::new(sink));

        let user_id = Uuid::new_v4();
        engine.register(user_id).await.unwrap();
        engine.upgrade(user_id, "pro").await.unwrap();
        engine
            .downgrade(user_id, "standard", EffectiveDate::EndOfPeriod)
            .await
            .unwrap();

        sweeper.sweep(datetime!(2025-04-01 00:00 UTC)).await.unwrap();
        let intent = rx.recv().await.unwrap();
        assert_eq!(intent.action, IntentAction::ScheduledChangeApplied);
        assert_eq!(intent.from_plan_id, "pro");
        assert_eq!(intent.to_plan_id, "standard");
        assert_eq!(intent.current_period_end, datetime!(2025-05-01 00:00 UTC));
    }

    #[tokio::test]
    async fn test_stale_records_do_not_block_later_due_ones() {
        let h = harness(datetime!(2005-01-10 00:00 UTC));
        let stale_a = Uuid::new_v4();
        let stale_b = Uuid::new_v4();
        h.engine.register(stale_a).await.unwrap();
        h.engine.register(stale_b).await.unwrap();

        h.clock.set(datetime!(2025-03-01 00:00 UTC));
        let healthy = Uuid::new_v4();
        h.engine.register(healthy).await.unwrap();

        let sweeper = h.sweeper.with_batch_size(2);
        let report = sweeper.sweep(datetime!(2025-04-02 00:00 UTC)).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.flagged, 2);
        assert_eq!(report.rolled, 1);
        assert_eq!(report.errors, 0);

        let stale = h.engine.get_current(stale_a).await.unwrap();
        assert!(stale.needs_review());
        assert_eq!(stale.current_period_end(), datetime!(2005-02-10 00:00 UTC));
        let sub = h.engine.get_current(healthy).await.unwrap();
        assert_eq!(sub.current_period_end(), datetime!(2025-05-01 00:00 UTC));

        // The flagged records still sort first and fill the opening batch
        let next = sweeper.sweep(datetime!(2025-05-02 00:00 UTC)).await.unwrap();
        assert_eq!(next.examined, 3);
        assert_eq!(next.flagged, 0);
        assert_eq!(next.rolled, 1);
        let sub = h.engine.get_current(healthy).await.unwrap();
        assert_eq!(sub.current_period_end(), datetime!(2025-06-01 00:00 UTC));
    }

    #[tokio::test]
    async fn test_small_batches_cover_everyone() {
        let h = harness(datetime!(2025-03-01 00:00 UTC));
        let mut users = Vec::new();
        for _ in 0..7 {
            let user_id = Uuid::new_v4();
            h.engine.register(user_id).await.unwrap();
            users.push(user_id);
        }

        let sweeper = h.sweeper.with_batch_size(3);
        let report = sweeper.sweep(datetime!(2025-04-02 00:00 UTC)).await.unwrap();
        assert_eq!(report.examined, 7);
        assert_eq!(report.rolled, 7);
        for user_id in users {
            let sub = h.engine.get_current(user_id).await.unwrap();
            assert_eq!(sub.current_period_end(), datetime!(2025-05-01 00:00 UTC));
        }
    }
}
