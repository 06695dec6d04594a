//! Transition Engine
//!
//! Validates and executes plan changes. Every operation is a read, a pure
//! state derivation on [`Subscription`], and a versioned write. A lost race
//! re-reads and re-validates against the fresh record, so a decision is never
//! committed on top of state it did not see.
//!
//! Direction is decided by the catalog: price strictly up is an upgrade and
//! takes effect now, anything else is downgrade-class and defaults to the
//! end of the current period.

use std::sync::Arc;
use std::time::Duration;

use kabuscope_shared::SharedClock;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::intents::{BillingIntent, IntentAction, SharedIntentSink};
use crate::store::SubscriptionStore;
use crate::subscriptions::{
    EffectiveDate, Subscription, SubscriptionStatus, TransitionKind, TransitionRequest,
};

/// Retries after the first attempt when a write loses a version race
const CONFLICT_RETRIES: usize = 4;

/// A derived state plus what to tell the billing provider about it
struct Mutation {
    next: Subscription,
    action: IntentAction,
    from_plan_id: String,
    to_plan_id: String,
    effective_at: OffsetDateTime,
    reason: Option<String>,
}

/// Result of a catalog-classified plan change
#[derive(Debug, Clone, Serialize)]
pub struct PlanChange {
    pub kind: TransitionKind,
    pub subscription: Subscription,
}

pub struct TransitionEngine {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    clock: SharedClock,
    intents: SharedIntentSink,
}

impl TransitionEngine {
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
        }
    }

    // =========================================================================
    // Queries and registration
    // =========================================================================

    /// Most recent record for the user, which may be cancelled
    pub async fn get_current(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .current(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))
    }

    /// Start a free-plan subscription. Returns the live record unchanged if
    /// one exists; a cancelled history gets a brand new record.
    pub async fn register(&self, user_id: Uuid) -> BillingResult<Subscription> {
        if let Some(existing) = self.store.current(user_id).await? {
            if existing.is_live() {
                tracing::debug!(user_id = %user_id, "Registration skipped, live subscription exists");
                return Ok(existing);
            }
        }

        let now = self.clock.now();
        let fresh = Subscription::register(user_id, self.catalog.free_plan(), now)?;

        match self.store.insert(&fresh).await {
            Ok(created) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %created.id(),
                    plan_id = %created.plan_id(),
                    period_end = %created.current_period_end(),
                    "Subscription registered"
                );
                Ok(created)
            }
            // Lost a race against a concurrent registration; theirs wins
            Err(BillingError::ConcurrentModification(_)) => {
                match self.store.current(user_id).await? {
                    Some(existing) if existing.is_live() => Ok(existing),
                    _ => Err(BillingError::ConcurrentModification(user_id)),
                }
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Move to a strictly pricier plan, effective now. Clears any scheduled
    /// downgrade or cancellation. Repeating the call is a no-op.
    pub async fn upgrade(&self, user_id: Uuid, target_plan_id: &str) -> BillingResult<Subscription> {
        let target = self.selectable_plan(target_plan_id)?;
        self.mutate(user_id, "upgrade", |current, now| {
            self.upgrade_step(current, target, now)
        })
        .await
    }

    /// Move to a plan that is not pricier. `EndOfPeriod` keeps the current
    /// plan until the boundary; `Immediate` swaps now.
    pub async fn downgrade(
        &self,
        user_id: Uuid,
        target_plan_id: &str,
        effective_date: EffectiveDate,
    ) -> BillingResult<Subscription> {
        let target = self.selectable_plan(target_plan_id)?;
        self.mutate(user_id, "downgrade", |current, now| {
            self.downgrade_step(current, target, effective_date, now)
        })
        .await
    }

    /// Cancel an active subscription, at period end or immediately. The
    /// user lands on the free plan either way.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        request: TransitionRequest,
    ) -> BillingResult<Subscription> {
        tracing::debug!(
            user_id = %user_id,
            requested_by = %request.requested_by,
            effective_date = ?request.effective_date,
            "Cancellation requested"
        );
        self.mutate(user_id, "cancel", |current, now| {
            self.cancel_step(current, &request, now)
        })
        .await
    }

    /// Classify the change through the catalog and route it. Upgrades ignore
    /// `effective_date` and always apply now.
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        target_plan_id: &str,
        effective_date: EffectiveDate,
    ) -> BillingResult<PlanChange> {
        let target = self.selectable_plan(target_plan_id)?;
        let (subscription, action) = self
            .mutate_tracked(user_id, "change_plan", |current, now| {
                if current.plan_id() == target.plan_id {
                    return Err(BillingError::InvalidTransition(format!(
                        "already subscribed to plan {}",
                        target.plan_id
                    )));
                }
                let from = self.catalog.get_plan(current.plan_id())?;
                if self.catalog.compare(from, target).is_upgrade {
                    self.upgrade_step(current, target, now)
                } else {
                    self.downgrade_step(current, target, effective_date, now)
                }
            })
            .await?;

        let kind = match action {
            Some(IntentAction::Upgrade) => TransitionKind::Upgrade,
            _ => TransitionKind::Downgrade,
        };

        Ok(PlanChange { kind, subscription })
    }

    /// Drop a scheduled downgrade or cancellation and return to `active`
    pub async fn withdraw_pending_change(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.mutate(user_id, "withdraw_pending_change", |current, now| {
            let Some(pending) = current.pending_change() else {
                return Err(BillingError::InvalidTransition(
                    "no pending change to withdraw".to_string(),
                ));
            };
            Ok(Some(Mutation {
                next: current.pending_withdrawn(now),
                action: IntentAction::PendingChangeWithdrawn,
                from_plan_id: pending.target_plan_id.clone(),
                to_plan_id: current.plan_id().to_string(),
                effective_at: now,
                reason: None,
            }))
        })
        .await
    }

    // =========================================================================
    // State derivations
    // =========================================================================

    fn upgrade_step(
        &self,
        current: &Subscription,
        target: &Plan,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Mutation>> {
        if current.plan_id() == target.plan_id {
            // Same plan again: nothing to do unless it supersedes a pending change
            if current.pending_change().is_none()
                && current.status() == SubscriptionStatus::Active
            {
                return Ok(None);
            }
            return Ok(Some(Mutation {
                next: current.upgraded(target, now),
                action: IntentAction::PendingChangeWithdrawn,
                from_plan_id: current.plan_id().to_string(),
                to_plan_id: target.plan_id.clone(),
                effective_at: now,
                reason: None,
            }));
        }

        let from = self.catalog.get_plan(current.plan_id())?;
        if !self.catalog.compare(from, target).is_upgrade {
            return Err(BillingError::InvalidTransition(format!(
                "upgrade requires a higher price: {} costs {} and {} costs {}",
                target.plan_id, target.price_monthly, from.plan_id, from.price_monthly
            )));
        }

        Ok(Some(Mutation {
            next: current.upgraded(target, now),
            action: IntentAction::Upgrade,
            from_plan_id: from.plan_id.clone(),
            to_plan_id: target.plan_id.clone(),
            effective_at: now,
            reason: None,
        }))
    }

    fn downgrade_step(
        &self,
        current: &Subscription,
        target: &Plan,
        effective_date: EffectiveDate,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Mutation>> {
        if current.plan_id() == target.plan_id {
            return Err(BillingError::InvalidTransition(format!(
                "already subscribed to plan {}",
                target.plan_id
            )));
        }

        let from = self.catalog.get_plan(current.plan_id())?;
        if self.catalog.compare(from, target).is_upgrade {
            return Err(BillingError::InvalidTransition(format!(
                "downgrade requires an equal or lower price: {} costs {} and {} costs {}",
                target.plan_id, target.price_monthly, from.plan_id, from.price_monthly
            )));
        }

        match effective_date {
            EffectiveDate::EndOfPeriod => {
                let already_scheduled = current.status() == SubscriptionStatus::Active
                    && current.pending_change().is_some_and(|p| {
                        p.kind == TransitionKind::Downgrade && p.target_plan_id == target.plan_id
                    });
                if already_scheduled {
                    return Ok(None);
                }
                Ok(Some(Mutation {
                    next: current.downgrade_scheduled(target, now),
                    action: IntentAction::DowngradeScheduled,
                    from_plan_id: from.plan_id.clone(),
                    to_plan_id: target.plan_id.clone(),
                    effective_at: current.current_period_end(),
                    reason: None,
                }))
            }
            EffectiveDate::Immediate => Ok(Some(Mutation {
                next: current.downgraded_now(target, now),
                action: IntentAction::Downgrade,
                from_plan_id: from.plan_id.clone(),
                to_plan_id: target.plan_id.clone(),
                effective_at: now,
                reason: None,
            })),
        }
    }

    fn cancel_step(
        &self,
        current: &Subscription,
        request: &TransitionRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Mutation>> {
        if current.status() == SubscriptionStatus::PendingCancellation {
            return Err(BillingError::InvalidTransition(format!(
                "cancellation already scheduled for {}",
                current.current_period_end()
            )));
        }

        let free = self.catalog.free_plan();
        let (next, action, effective_at) = match request.effective_date {
            EffectiveDate::EndOfPeriod => (
                current.cancellation_scheduled(free, request.reason.clone(), now),
                IntentAction::CancellationScheduled,
                current.current_period_end(),
            ),
            EffectiveDate::Immediate => (
                current.cancelled_now(free, request.reason.clone(), now),
                IntentAction::Cancellation,
                now,
            ),
        };

        Ok(Some(Mutation {
            next,
            action,
            from_plan_id: current.plan_id().to_string(),
            to_plan_id: free.plan_id.clone(),
            effective_at,
            reason: request.reason.clone(),
        }))
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Plans a user may move to: known and still on sale
    fn selectable_plan(&self, plan_id: &str) -> BillingResult<&Plan> {
        let plan = self.catalog.get_plan(plan_id)?;
        if !plan.is_active {
            return Err(BillingError::InvalidTransition(format!(
                "plan {} is no longer offered",
                plan_id
            )));
        }
        Ok(plan)
    }

    async fn mutate<F>(
        &self,
        user_id: Uuid,
        operation: &'static str,
        derive: F,
    ) -> BillingResult<Subscription>
    where
        F: Fn(&Subscription, OffsetDateTime) -> BillingResult<Option<Mutation>> + Send + Sync,
    {
        self.mutate_tracked(user_id, operation, derive)
            .await
            .map(|(subscription, _)| subscription)
    }

    /// Read-derive-write with bounded retries on version conflicts. Also
    /// returns the committed action, `None` when the derivation was a no-op.
    async fn mutate_tracked<F>(
        &self,
        user_id: Uuid,
        operation: &'static str,
        derive: F,
    ) -> BillingResult<(Subscription, Option<IntentAction>)>
    where
        F: Fn(&Subscription, OffsetDateTime) -> BillingResult<Option<Mutation>> + Send + Sync,
    {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(200))
            .map(jitter)
            .take(CONFLICT_RETRIES);

        let result = RetryIf::start(
            strategy,
            || self.attempt(user_id, operation, &derive),
            |e: &BillingError| e.is_conflict(),
        )
        .await;

        if let Err(e) = &result {
            if e.is_conflict() {
                tracing::error!(
                    user_id = %user_id,
                    operation = operation,
                    "Subscription write kept losing version races, giving up"
                );
            }
        }
        result
    }

    async fn attempt<F>(
        &self,
        user_id: Uuid,
        operation: &'static str,
        derive: &F,
    ) -> BillingResult<(Subscription, Option<IntentAction>)>
    where
        F: Fn(&Subscription, OffsetDateTime) -> BillingResult<Option<Mutation>> + Send + Sync,
    {
        let current = match self.store.current(user_id).await? {
            Some(s) if s.is_live() => s,
            _ => return Err(BillingError::NoActiveSubscription(user_id)),
        };

        let now = self.clock.now();
        let Some(mutation) = derive(&current, now)? else {
            tracing::debug!(user_id = %user_id, operation = operation, "Transition is a no-op");
            return Ok((current, None));
        };

        let Some(stored) = self.store.compare_and_swap(&mutation.next).await? else {
            tracing::debug!(
                user_id = %user_id,
                operation = operation,
                version = current.version(),
                "Version conflict, retrying"
            );
            return Err(BillingError::ConcurrentModification(user_id));
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %stored.id(),
            action = mutation.action.as_str(),
            from_plan_id = %mutation.from_plan_id,
            to_plan_id = %mutation.to_plan_id,
            effective_at = %mutation.effective_at,
            status = %stored.status(),
            "Subscription transition committed"
        );

        let action = mutation.action;
        self.intents.emit(BillingIntent {
            intent_id: Uuid::new_v4(),
            user_id,
            subscription_id: stored.id(),
            action: mutation.action,
            from_plan_id: mutation.from_plan_id,
            to_plan_id: mutation.to_plan_id,
            effective_at: mutation.effective_at,
            current_period_end: stored.current_period_end(),
            reason: mutation.reason,
            created_at: now,
        });

        Ok((stored, Some(action)))
    }
}
