//! Billing Invariants Module
//!
//! Runnable consistency checks over subscription records. They only read,
//! so they are safe to run at any time, including while a sweep is in
//! progress (a record caught mid-sweep may show up as overdue).
//!
//! Each violation names the invariant, the users affected and enough context
//! to debug without going back to the database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kabuscope_shared::SharedClock;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::BillingResult;
use crate::store::SubscriptionStore;
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// How far past its period end a live record may drift before the sweep
/// counts as behind
const OVERDUE_GRACE: Duration = Duration::days(1);

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ViolationSeverity {
    /// Critical - quotas or billing may be resolved against the wrong plan
    Critical,
    /// High - record state contradicts itself
    High,
    /// Medium - needs an operator, nothing is wrong yet
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub records_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations.iter().map(|v| v.severity).min()
    }
}

type Check = fn(&InvariantChecker, &[Subscription], OffsetDateTime) -> Vec<InvariantViolation>;

const CHECKS: &[(&str, Check)] = &[
    ("single_live_subscription", InvariantChecker::check_single_live_subscription),
    ("period_ordering", InvariantChecker::check_period_ordering),
    ("plan_resolvable", InvariantChecker::check_plan_resolvable),
    ("pending_target_resolvable", InvariantChecker::check_pending_target_resolvable),
    ("pending_cancellation_consistent", InvariantChecker::check_pending_cancellation_consistent),
    ("cancelled_is_settled", InvariantChecker::check_cancelled_is_settled),
    ("flagged_for_review", InvariantChecker::check_flagged_for_review),
    ("rollover_not_overdue", InvariantChecker::check_rollover_not_overdue),
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    clock: SharedClock,
}

impl InvariantChecker {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let records = self.store.list_all().await?;

        let mut violations = Vec::new();
        for (_, check) in CHECKS {
            violations.extend(check(self, &records, now));
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: now,
            records_checked: records.len(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(records = summary.records_checked, "Billing invariants hold");
        } else {
            tracing::warn!(
                records = summary.records_checked,
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }

        Ok(summary)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(n, _)| *n == name) else {
            return Ok(vec![]);
        };
        let records = self.store.list_all().await?;
        Ok(check(self, &records, self.clock.now()))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }

    /// At most one non-cancelled record per user. Two would give the user
    /// two current plans.
    fn check_single_live_subscription(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        let mut live: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for sub in records.iter().filter(|s| s.is_live()) {
            live.entry(sub.user_id()).or_default().push(sub.id());
        }

        live.into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(user_id, ids)| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                user_ids: vec![user_id],
                description: format!("User has {} live subscriptions (expected 1)", ids.len()),
                context: serde_json::json!({ "subscription_ids": ids }),
                severity: ViolationSeverity::Critical,
            })
            .collect()
    }

    fn check_period_ordering(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter(|s| s.current_period_start() >= s.current_period_end())
            .map(|s| InvariantViolation {
                invariant: "period_ordering".to_string(),
                user_ids: vec![s.user_id()],
                description: "Billing period does not start before it ends".to_string(),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "current_period_start": s.current_period_start().to_string(),
                    "current_period_end": s.current_period_end().to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }

    fn check_plan_resolvable(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter(|s| s.is_live() && self.catalog.get_plan(s.plan_id()).is_err())
            .map(|s| InvariantViolation {
                invariant: "plan_resolvable".to_string(),
                user_ids: vec![s.user_id()],
                description: format!(
                    "Subscription is on plan '{}' which is not in the catalog; quotas fall back to the free plan",
                    s.plan_id()
                ),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "plan_id": s.plan_id(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect()
    }

    fn check_pending_target_resolvable(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter_map(|s| s.pending_change().map(|p| (s, p)))
            .filter(|(_, p)| self.catalog.get_plan(&p.target_plan_id).is_err())
            .map(|(s, p)| InvariantViolation {
                invariant: "pending_target_resolvable".to_string(),
                user_ids: vec![s.user_id()],
                description: format!(
                    "Pending {} targets unknown plan '{}'",
                    p.kind, p.target_plan_id
                ),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "target_plan_id": p.target_plan_id,
                    "effective_at": p.effective_at.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }

    /// A pending cancellation must carry the scheduled move to the free plan
    fn check_pending_cancellation_consistent(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        let free_plan_id = self.catalog.free_plan_id();
        records
            .iter()
            .filter(|s| s.status() == SubscriptionStatus::PendingCancellation)
            .filter(|s| {
                s.pending_change()
                    .map_or(true, |p| p.target_plan_id != free_plan_id)
            })
            .map(|s| InvariantViolation {
                invariant: "pending_cancellation_consistent".to_string(),
                user_ids: vec![s.user_id()],
                description: "Pending cancellation without a scheduled move to the free plan"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "pending_target": s.pending_change().map(|p| p.target_plan_id.clone()),
                    "free_plan_id": free_plan_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }

    /// Cancelled is terminal: no pending change, and a cancellation time
    fn check_cancelled_is_settled(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter(|s| s.status() == SubscriptionStatus::Cancelled)
            .filter(|s| s.pending_change().is_some() || s.cancelled_at().is_none())
            .map(|s| InvariantViolation {
                invariant: "cancelled_is_settled".to_string(),
                user_ids: vec![s.user_id()],
                description: "Cancelled subscription still has a pending change or no cancellation time"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "has_pending_change": s.pending_change().is_some(),
                    "cancelled_at": s.cancelled_at().map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }

    fn check_flagged_for_review(
        &self,
        records: &[Subscription],
        _now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter(|s| s.needs_review())
            .map(|s| InvariantViolation {
                invariant: "flagged_for_review".to_string(),
                user_ids: vec![s.user_id()],
                description: s
                    .review_note()
                    .unwrap_or("Subscription flagged for manual review")
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "plan_id": s.plan_id(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect()
    }

    /// Live records whose period ended more than a day ago mean the sweep
    /// is not running
    fn check_rollover_not_overdue(
        &self,
        records: &[Subscription],
        now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        records
            .iter()
            .filter(|s| s.is_live() && s.current_period_end() + OVERDUE_GRACE <= now)
            .map(|s| InvariantViolation {
                invariant: "rollover_not_overdue".to_string(),
                user_ids: vec![s.user_id()],
                description: "Billing period ended more than a day ago and was not rolled over"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": s.id(),
                    "current_period_end": s.current_period_end().to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect()
    }
}
