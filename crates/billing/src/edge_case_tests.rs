// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Boundary conditions and race conditions across the billing core:
//! - Quota consumption under contention and across day boundaries
//! - Plan transitions racing each other
//! - Billing period sweeps racing transitions and themselves
//! - The free-to-pro walk-through end to end

#[cfg(test)]
mod fixtures {
    use std::sync::Arc;

    use kabuscope_shared::ManualClock;
    use time::OffsetDateTime;

    use crate::catalog::PlanCatalog;
    use crate::intents::LogIntentSink;
    use crate::period_clock::BillingPeriodClock;
    use crate::quota::{InMemoryQuotaStore, QuotaLedger};
    use crate::store::{InMemorySubscriptionStore, SubscriptionStore};
    use crate::transitions::TransitionEngine;

    pub struct World {
        pub clock: Arc<ManualClock>,
        pub ledger: Arc<QuotaLedger>,
        pub engine: Arc<TransitionEngine>,
        pub sweeper: Arc<BillingPeriodClock>,
    }

    pub fn world(start: OffsetDateTime) -> World {
        let clock = Arc::new(ManualClock::new(start));
        let catalog = Arc::new(PlanCatalog::builtin());
        let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(InMemorySubscriptionStore::new());

        World {
            ledger: Arc::new(QuotaLedger::new(
                Arc::new(InMemoryQuotaStore::new()),
                subscriptions.clone(),
                catalog.clone(),
                clock.clone(),
            )),
            engine: Arc::new(TransitionEngine::new(
                subscriptions.clone(),
                catalog.clone(),
                clock.clone(),
                Arc::new(LogIntentSink),
            )),
            sweeper: Arc::new(BillingPeriodClock::new(
                subscriptions,
                catalog,
                clock.clone(),
                Arc::new(LogIntentSink),
            )),
            clock,
        }
    }
}

#[cfg(test)]
mod quota_tests {
    use std::sync::Arc;

    use kabuscope_shared::ResourceKind;
    use time::macros::datetime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::fixtures::world;
    use crate::error::BillingError;

    // =========================================================================
    // N parallel consumers against a limit of K: exactly K succeed
    // =========================================================================
    #[tokio::test]
    async fn test_parallel_consumers_exactly_limit_succeed() {
        let w = world(datetime!(2025-06-10 12:00 UTC));
        let user_id = Uuid::new_v4();
        let n = 40;

        let barrier = Arc::new(Barrier::new(n));
        let mut handles = vec![];
        for _ in 0..n {
            let ledger = Arc::clone(&w.ledger);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
                    .await
            }));
        }

        let mut succeeded = 0;
        let mut exceeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(BillingError::QuotaExceeded { .. }) => exceeded += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        // Free plan allows 10 analyses a day
        assert_eq!(succeeded, 10, "Exactly the daily limit should succeed");
        assert_eq!(exceeded, n - 10, "Everyone else should be rejected");

        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::AiAnalysis)
            .await
            .unwrap();
        assert_eq!(usage.used, 10);
        assert_eq!(usage.remaining, 0);
    }

    // =========================================================================
    // Mixed multi-unit requests never jointly pass the limit
    // =========================================================================
    #[tokio::test]
    async fn test_parallel_multi_unit_requests_never_overspend() {
        let w = world(datetime!(2025-06-10 12:00 UTC));
        let user_id = Uuid::new_v4();

        let barrier = Arc::new(Barrier::new(12));
        let mut handles = vec![];
        for i in 0..12u32 {
            let ledger = Arc::clone(&w.ledger);
            let barrier = Arc::clone(&barrier);
            let amount = 1 + i % 3;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .check_and_consume(user_id, ResourceKind::AiAnalysis, amount)
                    .await
                    .map(|_| amount)
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if let Ok(amount) = handle.await.unwrap() {
                granted += amount;
            }
        }

        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::AiAnalysis)
            .await
            .unwrap();
        assert!(granted <= 10, "Granted {} units past a limit of 10", granted);
        assert_eq!(usage.used, granted);
    }

    // =========================================================================
    // Used and remaining after M of L
    // =========================================================================
    #[tokio::test]
    async fn test_usage_after_partial_consumption() {
        let w = world(datetime!(2025-06-10 12:00 UTC));
        let user_id = Uuid::new_v4();

        for m in 1..=10u32 {
            w.ledger
                .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
                .await
                .unwrap();
            let usage = w
                .ledger
                .get_usage(user_id, ResourceKind::AiAnalysis)
                .await
                .unwrap();
            assert_eq!(usage.used, m);
            assert_eq!(usage.remaining, 10 - m);
        }
    }

    // =========================================================================
    // Exhausted on day D, fresh on day D+1
    // =========================================================================
    #[tokio::test]
    async fn test_quota_resets_at_utc_midnight() {
        let w = world(datetime!(2025-06-10 23:59:59 UTC));
        let user_id = Uuid::new_v4();

        w.ledger
            .check_and_consume(user_id, ResourceKind::AiAnalysis, 10)
            .await
            .unwrap();
        let err = w
            .ledger
            .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
            .await
            .unwrap_err();
        match err {
            BillingError::QuotaExceeded { resets_at, .. } => {
                assert_eq!(resets_at, datetime!(2025-06-11 00:00 UTC));
            }
            other => panic!("expected QuotaExceeded, got {other}"),
        }

        w.clock.set(datetime!(2025-06-11 00:00 UTC));
        let grant = w
            .ledger
            .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
            .await
            .unwrap();
        assert_eq!(grant.used, 1);
        assert_eq!(grant.remaining, 9);
        assert_eq!(grant.resets_at, datetime!(2025-06-12 00:00 UTC));
    }

    // =========================================================================
    // A rejected request leaves the counter exactly where it was
    // =========================================================================
    #[tokio::test]
    async fn test_rejection_does_not_partially_consume() {
        let w = world(datetime!(2025-06-10 12:00 UTC));
        let user_id = Uuid::new_v4();

        w.ledger
            .check_and_consume(user_id, ResourceKind::ApiCall, 195)
            .await
            .unwrap();
        assert!(w
            .ledger
            .check_and_consume(user_id, ResourceKind::ApiCall, 10)
            .await
            .is_err());

        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::ApiCall)
            .await
            .unwrap();
        assert_eq!(usage.used, 195);
        assert_eq!(usage.remaining, 5);
    }

    // =========================================================================
    // Users do not share counters
    // =========================================================================
    #[tokio::test]
    async fn test_users_isolated() {
        let w = world(datetime!(2025-06-10 12:00 UTC));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        w.ledger
            .check_and_consume(alice, ResourceKind::AiAnalysis, 10)
            .await
            .unwrap();
        let grant = w
            .ledger
            .check_and_consume(bob, ResourceKind::AiAnalysis, 1)
            .await
            .unwrap();
        assert_eq!(grant.used, 1);
    }
}

#[cfg(test)]
mod transition_tests {
    use std::sync::Arc;

    use kabuscope_shared::Clock;
    use time::macros::datetime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::fixtures::world;
    use crate::subscriptions::{EffectiveDate, SubscriptionStatus, TransitionRequest};

    // =========================================================================
    // Upgrading twice equals upgrading once
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_twice_same_final_state() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();

        let once = w.engine.upgrade(user_id, "pro").await.unwrap();
        let twice = w.engine.upgrade(user_id, "pro").await.unwrap();

        assert_eq!(twice.plan_id(), "pro");
        assert!(twice.pending_change().is_none());
        assert_eq!(once, twice, "Second upgrade should not touch the record");
    }

    // =========================================================================
    // Cancel at end of period, then upgrade before the boundary
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_supersedes_pending_cancellation() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "standard").await.unwrap();

        let request = TransitionRequest::cancellation(
            user_id,
            w.clock.now(),
            EffectiveDate::EndOfPeriod,
            Some("trying a competitor".to_string()),
        );
        let pending = w.engine.cancel(user_id, request).await.unwrap();
        assert_eq!(pending.status(), SubscriptionStatus::PendingCancellation);

        w.clock.set(datetime!(2025-03-20 00:00 UTC));
        let upgraded = w.engine.upgrade(user_id, "pro").await.unwrap();
        assert_eq!(upgraded.status(), SubscriptionStatus::Active);
        assert_eq!(upgraded.plan_id(), "pro");
        assert!(upgraded.pending_change().is_none());

        // The boundary passes without cancelling anything
        let report = w.sweeper.sweep(datetime!(2025-04-01 00:00 UTC)).await.unwrap();
        assert_eq!(report.cancelled, 0);
        let sub = w.engine.get_current(user_id).await.unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Active);
        assert_eq!(sub.plan_id(), "pro");
    }

    // =========================================================================
    // Upgrade also supersedes a pending downgrade
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_supersedes_pending_downgrade() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "standard").await.unwrap();
        w.engine
            .downgrade(user_id, "free", EffectiveDate::EndOfPeriod)
            .await
            .unwrap();

        let upgraded = w.engine.upgrade(user_id, "pro").await.unwrap();
        assert!(upgraded.pending_change().is_none());
    }

    // =========================================================================
    // Concurrent transitions serialize: one current plan, versions line up
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_transitions_serialize() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        let registered = w.engine.register(user_id).await.unwrap();

        let barrier = Arc::new(Barrier::new(6));
        let mut handles = vec![];
        for i in 0..6 {
            let engine = Arc::clone(&w.engine);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if i % 2 == 0 {
                    engine.upgrade(user_id, "pro").await
                } else {
                    engine.upgrade(user_id, "standard").await
                }
            }));
        }

        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                committed += 1;
            }
        }

        let sub = w.engine.get_current(user_id).await.unwrap();
        assert!(committed >= 1);
        assert!(sub.plan_id() == "pro" || sub.plan_id() == "standard");
        assert!(sub.version() > registered.version());
        assert_eq!(sub.status(), SubscriptionStatus::Active);
    }

    // =========================================================================
    // Concurrent registrations yield a single live record
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_registration_single_record() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let engine = Arc::clone(&w.engine);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.register(user_id).await.unwrap()
            }));
        }

        let mut ids = vec![];
        for handle in handles {
            ids.push(handle.await.unwrap().id());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "Every caller should see the same record");
    }
}

#[cfg(test)]
mod sweep_tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::fixtures::world;
    use crate::subscriptions::EffectiveDate;

    // =========================================================================
    // Scheduled downgrade applies at the boundary
    // =========================================================================
    #[tokio::test]
    async fn test_downgrade_applies_after_boundary() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "pro").await.unwrap();

        let scheduled = w
            .engine
            .downgrade(user_id, "standard", EffectiveDate::EndOfPeriod)
            .await
            .unwrap();
        assert_eq!(scheduled.plan_id(), "pro");
        assert_eq!(
            scheduled.pending_change().unwrap().target_plan_id,
            "standard"
        );

        w.sweeper
            .sweep(datetime!(2025-04-01 00:00:01 UTC))
            .await
            .unwrap();
        let sub = w.engine.get_current(user_id).await.unwrap();
        assert_eq!(sub.plan_id(), "standard");
        assert!(sub.pending_change().is_none());
    }

    // =========================================================================
    // Same "now" twice: no double rollover, no double apply
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_twice_same_now_is_idempotent() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "pro").await.unwrap();
        w.engine
            .downgrade(user_id, "standard", EffectiveDate::EndOfPeriod)
            .await
            .unwrap();

        let now = datetime!(2025-04-01 06:00 UTC);
        let first = w.sweeper.sweep(now).await.unwrap();
        let after_first = w.engine.get_current(user_id).await.unwrap();

        let second = w.sweeper.sweep(now).await.unwrap();
        let after_second = w.engine.get_current(user_id).await.unwrap();

        assert_eq!(first.changes_applied, 1);
        assert_eq!(second.examined, 0);
        assert_eq!(after_first, after_second);
    }

    // =========================================================================
    // Two sweeps racing each other roll exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_overlapping_sweeps_roll_once() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let mut users = vec![];
        for _ in 0..5 {
            let user_id = Uuid::new_v4();
            w.engine.register(user_id).await.unwrap();
            users.push(user_id);
        }

        let now = datetime!(2025-04-01 00:00 UTC);
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let sweeper = Arc::clone(&w.sweeper);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                sweeper.sweep(now).await.unwrap()
            }));
        }

        let mut rolled = 0;
        for handle in handles {
            rolled += handle.await.unwrap().rolled;
        }
        assert_eq!(rolled, 5, "Each subscription should roll exactly once");

        for user_id in users {
            let sub = w.engine.get_current(user_id).await.unwrap();
            assert_eq!(sub.current_period_start(), datetime!(2025-04-01 00:00 UTC));
            assert_eq!(sub.current_period_end(), datetime!(2025-05-01 00:00 UTC));
        }
    }

    // =========================================================================
    // Withdrawn downgrade is not applied by a later sweep
    // =========================================================================
    #[tokio::test]
    async fn test_withdrawn_change_not_applied() {
        let w = world(datetime!(2025-03-01 00:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "pro").await.unwrap();
        w.engine
            .downgrade(user_id, "free", EffectiveDate::EndOfPeriod)
            .await
            .unwrap();
        w.engine.withdraw_pending_change(user_id).await.unwrap();

        let report = w.sweeper.sweep(datetime!(2025-04-01 00:00 UTC)).await.unwrap();
        assert_eq!(report.changes_applied, 0);
        assert_eq!(report.rolled, 1);
        assert_eq!(w.engine.get_current(user_id).await.unwrap().plan_id(), "pro");
    }

    // =========================================================================
    // Periods stay contiguous across month-end clamping
    // =========================================================================
    #[tokio::test]
    async fn test_month_end_anchor_rollovers_are_contiguous() {
        let w = world(datetime!(2025-01-31 08:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();

        let mut previous_end = w
            .engine
            .get_current(user_id)
            .await
            .unwrap()
            .current_period_end();
        assert_eq!(previous_end, datetime!(2025-02-28 08:00 UTC));

        for now in [
            datetime!(2025-02-28 08:00 UTC),
            datetime!(2025-03-31 08:00 UTC),
            datetime!(2025-04-30 08:00 UTC),
        ] {
            w.sweeper.sweep(now).await.unwrap();
            let sub = w.engine.get_current(user_id).await.unwrap();
            assert_eq!(sub.current_period_start(), previous_end);
            assert!(sub.current_period_start() < sub.current_period_end());
            previous_end = sub.current_period_end();
        }
        assert_eq!(previous_end, datetime!(2025-05-31 08:00 UTC));
    }
}

#[cfg(test)]
mod scenario_tests {
    use kabuscope_shared::ResourceKind;
    use time::macros::datetime;
    use uuid::Uuid;

    use super::fixtures::world;
    use crate::error::BillingError;

    // =========================================================================
    // Free user exhausts analyses, upgrades to Pro, next call succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_free_to_pro_same_day() {
        let w = world(datetime!(2025-06-10 09:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();

        for i in 0..10 {
            let grant = w
                .ledger
                .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
                .await
                .unwrap();
            assert_eq!(grant.remaining, 9 - i);
        }

        let err = w
            .ledger
            .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuotaExceeded {
                limit: 10,
                used: 10,
                remaining: 0,
                ..
            }
        ));
        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::AiAnalysis)
            .await
            .unwrap();
        assert_eq!(usage.remaining, 0);
        assert!(!usage.has_quota());

        w.engine.upgrade(user_id, "pro").await.unwrap();

        let grant = w
            .ledger
            .check_and_consume(user_id, ResourceKind::AiAnalysis, 1)
            .await
            .unwrap();
        assert_eq!(grant.limit, 100);
        assert_eq!(grant.used, 11);
        assert_eq!(grant.remaining, 89);
    }

    // =========================================================================
    // A scheduled downgrade keeps the higher limit until the boundary
    // =========================================================================
    #[tokio::test]
    async fn test_scheduled_downgrade_keeps_limit_until_boundary() {
        let w = world(datetime!(2025-06-10 09:00 UTC));
        let user_id = Uuid::new_v4();
        w.engine.register(user_id).await.unwrap();
        w.engine.upgrade(user_id, "pro").await.unwrap();
        w.engine
            .downgrade(
                user_id,
                "free",
                crate::subscriptions::EffectiveDate::EndOfPeriod,
            )
            .await
            .unwrap();

        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::AiAnalysis)
            .await
            .unwrap();
        assert_eq!(usage.limit, 100);

        w.clock.set(datetime!(2025-07-10 09:00 UTC));
        w.sweeper.sweep_now().await.unwrap();
        let usage = w
            .ledger
            .get_usage(user_id, ResourceKind::AiAnalysis)
            .await
            .unwrap();
        assert_eq!(usage.limit, 10);
    }
}
