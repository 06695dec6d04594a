//! Quota Ledger
//!
//! Per-user, per-resource daily consumption counters. Each counter is keyed
//! by the UTC calendar day it belongs to, so a new day starts at zero without
//! any reset job. Limits are resolved from the user's current plan on every
//! call; a plan change is visible to the very next request.
//!
//! Consumption is a single conditional increment in the backing store. The
//! ledger never reads a counter and writes it back as two steps.

mod memory;
mod postgres;
mod redis_store;

pub use memory::InMemoryQuotaStore;
pub use postgres::PgQuotaStore;
pub use redis_store::RedisQuotaStore;

use std::sync::Arc;

use async_trait::async_trait;
use kabuscope_shared::{ResourceKind, SharedClock};
use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::calendar::{next_utc_midnight, utc_day};
use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

/// Identifies one daily counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub user_id: Uuid,
    pub resource: ResourceKind,
    pub day: Date,
}

/// Result of an atomic conditional increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The increment was applied; `used` includes it
    Consumed { used: u32 },
    /// Applying the increment would pass the limit; nothing was written
    Rejected { used: u32 },
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Add `amount` to the counter only if the result stays within `limit`
    async fn try_consume(
        &self,
        key: &QuotaKey,
        amount: u32,
        limit: u32,
    ) -> BillingResult<ConsumeOutcome>;

    /// Current count, zero if the counter does not exist yet
    async fn used(&self, key: &QuotaKey) -> BillingResult<u32>;

    /// Drop counters for days before `day`. Returns how many were removed.
    async fn prune_before(&self, day: Date) -> BillingResult<u64>;
}

/// Successful consumption
#[derive(Debug, Clone, Serialize)]
pub struct QuotaGrant {
    pub resource: ResourceKind,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub resets_at: OffsetDateTime,
}

/// Non-mutating view of a counter
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub resource: ResourceKind,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub resets_at: OffsetDateTime,
}

impl UsageSnapshot {
    pub fn has_quota(&self) -> bool {
        self.remaining > 0
    }
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    clock: SharedClock,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            subscriptions,
            catalog,
            clock,
        }
    }

    /// Atomically consume `amount` units of today's allowance.
    ///
    /// On `QuotaExceeded` nothing is consumed.
    pub async fn check_and_consume(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        amount: u32,
    ) -> BillingResult<QuotaGrant> {
        if amount == 0 {
            return Err(BillingError::InvalidRequest(
                "quota amount must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let plan = self.current_plan(user_id).await?;
        let limit = plan.daily_limit(resource);
        let key = QuotaKey {
            user_id,
            resource,
            day: utc_day(now),
        };
        let resets_at = next_utc_midnight(now);

        match self.store.try_consume(&key, amount, limit).await? {
            ConsumeOutcome::Consumed { used } => {
                tracing::debug!(
                    user_id = %user_id,
                    resource = %resource,
                    used = used,
                    limit = limit,
                    "Quota consumed"
                );
                Ok(QuotaGrant {
                    resource,
                    used,
                    limit,
                    remaining: limit.saturating_sub(used),
                    resets_at,
                })
            }
            ConsumeOutcome::Rejected { used } => {
                tracing::warn!(
                    user_id = %user_id,
                    resource = %resource,
                    plan_id = %plan.plan_id,
                    used = used,
                    limit = limit,
                    requested = amount,
                    "Daily quota exceeded"
                );
                Err(BillingError::QuotaExceeded {
                    resource,
                    limit,
                    used,
                    remaining: limit.saturating_sub(used),
                    resets_at,
                })
            }
        }
    }

    pub async fn get_usage(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<UsageSnapshot> {
        let now = self.clock.now();
        let plan = self.current_plan(user_id).await?;
        let limit = plan.daily_limit(resource);
        let key = QuotaKey {
            user_id,
            resource,
            day: utc_day(now),
        };
        let used = self.store.used(&key).await?;

        Ok(UsageSnapshot {
            resource,
            used,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at: next_utc_midnight(now),
        })
    }

    /// Usage for every resource kind
    pub async fn get_all_usage(&self, user_id: Uuid) -> BillingResult<Vec<UsageSnapshot>> {
        let mut usage = Vec::with_capacity(ResourceKind::ALL.len());
        for resource in ResourceKind::ALL {
            usage.push(self.get_usage(user_id, resource).await?);
        }
        Ok(usage)
    }

    /// Remove counters older than `keep_days` full days
    pub async fn prune(&self, keep_days: u32) -> BillingResult<u64> {
        let today = utc_day(self.clock.now());
        let cutoff = today
            .checked_sub(time::Duration::days(i64::from(keep_days)))
            .unwrap_or(today);
        let removed = self.store.prune_before(cutoff).await?;
        tracing::info!(cutoff = %cutoff, removed = removed, "Pruned quota counters");
        Ok(removed)
    }

    /// Current plan for quota purposes. Users without a record get the free
    /// plan. A stored plan id the catalog no longer knows is an anomaly and
    /// also falls back to the free plan, logged.
    pub async fn current_plan(&self, user_id: Uuid) -> BillingResult<Plan> {
        let Some(subscription) = self.subscriptions.current(user_id).await? else {
            tracing::debug!(user_id = %user_id, "No subscription, using free plan quotas");
            return Ok(self.catalog.free_plan().clone());
        };

        match self.catalog.get_plan(subscription.plan_id()) {
            Ok(plan) => Ok(plan.clone()),
            Err(_) => {
                tracing::error!(
                    user_id = %user_id,
                    plan_id = %subscription.plan_id(),
                    "Subscription references a plan missing from the catalog, using free plan quotas"
                );
                Ok(self.catalog.free_plan().clone())
            }
        }
    }
}
