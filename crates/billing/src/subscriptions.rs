//! Subscription record and its lifecycle
//!
//! A [`Subscription`] can only be produced and changed inside this crate: the
//! transition engine and the billing period clock are the two writers, and
//! both go through the state functions below before persisting with a
//! version check. Callers outside the crate get read-only accessors.
//!
//! Lifecycle:
//! - `active -> pending_cancellation -> cancelled` (cancellation path)
//! - `active -> active` (plan swap, optionally via a pending change)
//! - `cancelled` is terminal; re-registering creates a new record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::add_months_anchored;
use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PendingCancellation,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PendingCancellation => "pending_cancellation",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Cancelled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "pending_cancellation" => Ok(SubscriptionStatus::PendingCancellation),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(BillingError::Database(format!(
                "unknown subscription status {}",
                other
            ))),
        }
    }
}

/// Direction of a plan change, decided by the catalog and never by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Upgrade,
    Downgrade,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Upgrade => "upgrade",
            TransitionKind::Downgrade => "downgrade",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransitionKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upgrade" => Ok(TransitionKind::Upgrade),
            "downgrade" => Ok(TransitionKind::Downgrade),
            other => Err(BillingError::Database(format!(
                "unknown transition kind {}",
                other
            ))),
        }
    }
}

/// When a requested change should take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveDate {
    Immediate,
    #[default]
    EndOfPeriod,
}

/// A plan change scheduled for a future billing boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingChange {
    pub target_plan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    pub kind: TransitionKind,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

/// Transient description of a user's plan-change request
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// Target plan; cancellations leave this empty and fall to the free plan
    pub requested_plan_id: Option<String>,
    pub requested_by: Uuid,
    pub requested_at: OffsetDateTime,
    pub effective_date: EffectiveDate,
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn cancellation(
        requested_by: Uuid,
        requested_at: OffsetDateTime,
        effective_date: EffectiveDate,
        reason: Option<String>,
    ) -> Self {
        Self {
            requested_plan_id: None,
            requested_by,
            requested_at,
            effective_date,
            reason,
        }
    }
}

/// A user's binding to a plan for a billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    current_period_end: OffsetDateTime,
    billing_anchor_day: u8,
    pending_change: Option<PendingChange>,
    cancel_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    cancelled_at: Option<OffsetDateTime>,
    needs_review: bool,
    review_note: Option<String>,
    version: i64,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

/// Column values used to rehydrate a record from storage
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionParts {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub billing_anchor_day: u8,
    pub pending_change: Option<PendingChange>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub needs_review: bool,
    pub review_note: Option<String>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A scheduled change that the billing clock put into effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppliedChange {
    pub from_plan_id: String,
    pub to_plan_id: String,
    pub kind: TransitionKind,
    pub effective_at: OffsetDateTime,
    pub cancelled: bool,
}

/// Result of settling every billing boundary that has passed
#[derive(Debug, Clone)]
pub(crate) struct Settlement {
    pub next: Subscription,
    pub applied: Option<AppliedChange>,
    pub periods_rolled: u32,
    pub flagged: Option<String>,
}

/// Upper bound on periods rolled in one settlement (ten years of months)
const MAX_CATCH_UP_PERIODS: u32 = 120;

impl Subscription {
    /// Fresh free-plan subscription starting at `now`
    pub(crate) fn register(user_id: Uuid, free_plan: &Plan, now: OffsetDateTime) -> BillingResult<Self> {
        let anchor = now.day();
        let period_end = add_months_anchored(now, 1, anchor)?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            plan_id: free_plan.plan_id.clone(),
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: period_end,
            billing_anchor_day: anchor,
            pending_change: None,
            cancel_reason: None,
            cancelled_at: None,
            needs_review: false,
            review_note: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub(crate) fn from_parts(parts: SubscriptionParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            plan_id: parts.plan_id,
            status: parts.status,
            current_period_start: parts.current_period_start,
            current_period_end: parts.current_period_end,
            billing_anchor_day: parts.billing_anchor_day,
            pending_change: parts.pending_change,
            cancel_reason: parts.cancel_reason,
            cancelled_at: parts.cancelled_at,
            needs_review: parts.needs_review,
            review_note: parts.review_note,
            version: parts.version,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn current_period_start(&self) -> OffsetDateTime {
        self.current_period_start
    }

    pub fn current_period_end(&self) -> OffsetDateTime {
        self.current_period_end
    }

    pub fn billing_anchor_day(&self) -> u8 {
        self.billing_anchor_day
    }

    pub fn pending_change(&self) -> Option<&PendingChange> {
        self.pending_change.as_ref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn cancelled_at(&self) -> Option<OffsetDateTime> {
        self.cancelled_at
    }

    pub fn needs_review(&self) -> bool {
        self.needs_review
    }

    pub fn review_note(&self) -> Option<&str> {
        self.review_note.as_deref()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.is_live() && self.current_period_end <= now
    }

    pub(crate) fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    // =========================================================================
    // Transition Engine state changes
    // =========================================================================

    /// Swap to a pricier plan now. Clears any scheduled change, including a
    /// pending cancellation.
    pub(crate) fn upgraded(&self, target: &Plan, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.plan_id = target.plan_id.clone();
        next.status = SubscriptionStatus::Active;
        next.pending_change = None;
        next.cancel_reason = None;
        next.updated_at = now;
        next
    }

    /// Keep the current plan until the period ends, then move to `target`
    pub(crate) fn downgrade_scheduled(&self, target: &Plan, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.status = SubscriptionStatus::Active;
        next.pending_change = Some(PendingChange {
            target_plan_id: target.plan_id.clone(),
            effective_at: self.current_period_end,
            kind: TransitionKind::Downgrade,
            requested_at: now,
        });
        next.cancel_reason = None;
        next.updated_at = now;
        next
    }

    pub(crate) fn downgraded_now(&self, target: &Plan, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.plan_id = target.plan_id.clone();
        next.status = SubscriptionStatus::Active;
        next.pending_change = None;
        next.cancel_reason = None;
        next.updated_at = now;
        next
    }

    pub(crate) fn cancellation_scheduled(
        &self,
        free_plan: &Plan,
        reason: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.status = SubscriptionStatus::PendingCancellation;
        next.pending_change = Some(PendingChange {
            target_plan_id: free_plan.plan_id.clone(),
            effective_at: self.current_period_end,
            kind: TransitionKind::Downgrade,
            requested_at: now,
        });
        next.cancel_reason = reason;
        next.updated_at = now;
        next
    }

    /// Terminal cancellation. The period is frozen where it stands.
    pub(crate) fn cancelled_now(
        &self,
        free_plan: &Plan,
        reason: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.plan_id = free_plan.plan_id.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.pending_change = None;
        next.cancel_reason = reason;
        next.cancelled_at = Some(now);
        next.updated_at = now;
        next
    }

    pub(crate) fn pending_withdrawn(&self, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        next.clear_pending_review();
        next.status = SubscriptionStatus::Active;
        next.pending_change = None;
        next.cancel_reason = None;
        next.updated_at = now;
        next
    }

    // =========================================================================
    // Billing Period Clock state changes
    // =========================================================================

    /// Apply whatever is due at `now`: a pending change whose time has come,
    /// then contiguous period rollovers until the period covers `now`.
    ///
    /// Returns `None` when nothing is due, which is what makes repeated
    /// sweeps with the same `now` no-ops.
    pub(crate) fn settle(
        &self,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>> {
        if !self.is_due(now) {
            return Ok(None);
        }

        if self.periods_behind(now)? > MAX_CATCH_UP_PERIODS {
            let note = format!(
                "period ended {} and is more than {} periods behind",
                self.current_period_end, MAX_CATCH_UP_PERIODS
            );
            if self.review_note.as_deref() == Some(note.as_str()) {
                return Ok(None);
            }
            let mut next = self.clone();
            next.needs_review = true;
            next.review_note = Some(note.clone());
            next.updated_at = now;
            return Ok(Some(Settlement {
                next,
                applied: None,
                periods_rolled: 0,
                flagged: Some(note),
            }));
        }

        let mut next = self.clone();
        let mut applied = None;
        let mut flagged = None;

        if let Some(pending) = self.pending_change.clone() {
            if pending.effective_at <= now {
                match catalog.get_plan(&pending.target_plan_id) {
                    Ok(target) => {
                        let cancelled = self.status == SubscriptionStatus::PendingCancellation;
                        next.plan_id = target.plan_id.clone();
                        next.pending_change = None;
                        if cancelled {
                            next.status = SubscriptionStatus::Cancelled;
                            next.cancelled_at = Some(pending.effective_at);
                        }
                        applied = Some(AppliedChange {
                            from_plan_id: self.plan_id.clone(),
                            to_plan_id: target.plan_id.clone(),
                            kind: pending.kind,
                            effective_at: pending.effective_at,
                            cancelled,
                        });
                    }
                    Err(_) => {
                        let note = unresolvable_pending_note(&pending);
                        next.needs_review = true;
                        next.review_note = Some(note.clone());
                        flagged = Some(note);
                    }
                }
            }
        }

        let mut periods_rolled = 0;
        if next.status.is_live() {
            while next.current_period_end <= now {
                let start = next.current_period_end;
                next.current_period_start = start;
                next.current_period_end = add_months_anchored(start, 1, next.billing_anchor_day)?;
                periods_rolled += 1;
            }
        }

        next.updated_at = now;

        Ok(Some(Settlement {
            next,
            applied,
            periods_rolled,
            flagged,
        }))
    }
}

impl Subscription {
    /// Whole periods between the current period end and `now`, counted up to
    /// one past the catch-up limit
    fn periods_behind(&self, now: OffsetDateTime) -> BillingResult<u32> {
        let mut end = self.current_period_end;
        let mut behind = 0;
        while end <= now && behind <= MAX_CATCH_UP_PERIODS {
            end = add_months_anchored(end, 1, self.billing_anchor_day)?;
            behind += 1;
        }
        Ok(behind)
    }

    /// Drop the review flag if it was raised for the pending change that is
    /// being replaced or removed
    fn clear_pending_review(&mut self) {
        let raised_for_pending = match (&self.pending_change, self.review_note.as_deref()) {
            (Some(pending), Some(note)) => unresolvable_pending_note(pending) == note,
            _ => false,
        };
        if raised_for_pending {
            self.needs_review = false;
            self.review_note = None;
        }
    }
}

fn unresolvable_pending_note(pending: &PendingChange) -> String {
    format!(
        "pending {} to unknown plan {} could not be applied",
        pending.kind, pending.target_plan_id
    )
}
