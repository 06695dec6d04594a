//! Scheduled billing jobs
//!
//! Each job runs one billing operation and logs its outcome. Failures are
//! logged and the next tick tries again; nothing here panics the scheduler.

use kabuscope_billing::{BillingService, InvariantCheckSummary, SweepReport, ViolationSeverity};
use tracing::{error, info, warn};

/// Roll due billing periods and apply scheduled changes
pub async fn run_sweep(billing: &BillingService) -> Option<SweepReport> {
    match billing.period_clock.sweep_now().await {
        Ok(report) => {
            log_sweep_report(&report);
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Billing period sweep failed");
            None
        }
    }
}

pub async fn run_invariant_check(billing: &BillingService) -> Option<InvariantCheckSummary> {
    match billing.invariants.run_all_checks().await {
        Ok(summary) => {
            log_invariant_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant check failed to run");
            None
        }
    }
}

/// Drop quota counters older than `keep_days`
pub async fn run_quota_prune(billing: &BillingService, keep_days: u32) -> Option<u64> {
    match billing.quota.prune(keep_days).await {
        Ok(removed) => Some(removed),
        Err(e) => {
            error!(error = %e, keep_days = keep_days, "Quota counter prune failed");
            None
        }
    }
}

/// Log results of a billing period sweep
fn log_sweep_report(report: &SweepReport) {
    info!(
        examined = report.examined,
        rolled = report.rolled,
        periods_rolled = report.periods_rolled,
        changes_applied = report.changes_applied,
        cancelled = report.cancelled,
        flagged = report.flagged,
        "Billing period sweep complete"
    );

    if report.flagged > 0 {
        warn!(
            flagged = report.flagged,
            "Subscriptions flagged for manual review during sweep"
        );
    }
    if report.has_failures() {
        error!(
            conflicts = report.conflicts,
            errors = report.errors,
            "Billing period sweep left records unsettled, they will be retried next run"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            records_checked = summary.records_checked,
            checks_run = summary.checks_run,
            "Invariant check passed"
        );
        return;
    }

    for violation in &summary.violations {
        let users = violation
            .user_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = %users,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = %users,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        records_checked = summary.records_checked,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        worst = ?summary.worst_severity(),
        "Invariant check found violations"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabuscope_billing::PlanCatalog;
    use kabuscope_shared::ManualClock;
    use std::sync::Arc;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    fn service(clock: Arc<ManualClock>) -> BillingService {
        BillingService::in_memory(Arc::new(PlanCatalog::builtin()), clock)
    }

    #[tokio::test]
    async fn test_sweep_job_rolls_due_subscriptions() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-10 08:00 UTC)));
        let billing = service(clock.clone());
        let user_id = Uuid::new_v4();
        billing.transitions.register(user_id).await.unwrap();
        billing.transitions.upgrade(user_id, "pro").await.unwrap();
        billing
            .transitions
            .downgrade(user_id, "standard", Default::default())
            .await
            .unwrap();

        let report = run_sweep(&billing).await.unwrap();
        assert_eq!(report.examined, 0);

        clock.advance(Duration::days(32));
        let report = run_sweep(&billing).await.unwrap();
        assert_eq!(report.rolled, 1);
        assert_eq!(report.changes_applied, 1);

        let current = billing.transitions.get_current(user_id).await.unwrap();
        assert_eq!(current.plan_id(), "standard");
    }

    #[tokio::test]
    async fn test_invariant_job_reports_healthy_store() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-10 08:00 UTC)));
        let billing = service(clock);
        billing.transitions.register(Uuid::new_v4()).await.unwrap();

        let summary = run_invariant_check(&billing).await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.records_checked, 1);
    }

    #[tokio::test]
    async fn test_prune_job_drops_old_counters_only() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 12:00 UTC)));
        let billing = service(clock.clone());
        let user_id = Uuid::new_v4();

        billing
            .quota
            .check_and_consume(user_id, kabuscope_shared::ResourceKind::ApiCall, 1)
            .await
            .unwrap();
        clock.advance(Duration::days(10));
        billing
            .quota
            .check_and_consume(user_id, kabuscope_shared::ResourceKind::ApiCall, 1)
            .await
            .unwrap();

        assert_eq!(run_quota_prune(&billing, 7).await, Some(1));
        assert_eq!(run_quota_prune(&billing, 7).await, Some(0));

        let usage = billing
            .quota
            .get_usage(user_id, kabuscope_shared::ResourceKind::ApiCall)
            .await
            .unwrap();
        assert_eq!(usage.used, 1);
    }
}
