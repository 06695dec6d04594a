// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::QuotaExceeded carries the reset timestamp
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kabuscope Billing Module
//!
//! Subscription plans and daily usage quotas for the analysis service.
//!
//! ## Features
//!
//! - **Plan Catalog**: Versioned plan tiers with per-resource daily quotas
//! - **Quota Ledger**: Atomic check-and-consume against today's allowance
//! - **Transitions**: Upgrade now, downgrade or cancel at period end
//! - **Billing Period Clock**: Idempotent sweep that rolls periods and applies
//!   scheduled changes
//! - **Billing Intents**: Plan changes forwarded to the billing provider
//! - **Invariants**: Read-only consistency checks over subscription records

pub mod calendar;
pub mod catalog;
pub mod error;
pub mod intents;
pub mod invariants;
pub mod period_clock;
pub mod quota;
pub mod store;
pub mod subscriptions;
pub mod transitions;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Catalog
pub use catalog::{FeatureValue, Plan, PlanCatalog, PlanComparison};

// Error
pub use error::{BillingError, BillingResult};

// Intents
pub use intents::{
    BillingIntent, ChannelIntentSink, IntentAction, IntentForwarder, IntentForwarderHandle,
    IntentSink, LogIntentSink, SharedIntentSink,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Billing Period Clock
pub use period_clock::{BillingPeriodClock, SweepReport};

// Quota
pub use quota::{
    ConsumeOutcome, InMemoryQuotaStore, PgQuotaStore, QuotaGrant, QuotaKey, QuotaLedger,
    QuotaStore, RedisQuotaStore, UsageSnapshot,
};

// Stores
pub use store::{InMemorySubscriptionStore, PgSubscriptionStore, SubscriptionStore};

// Subscriptions
pub use subscriptions::{
    EffectiveDate, PendingChange, Subscription, SubscriptionStatus, TransitionKind,
    TransitionRequest,
};

// Transitions
pub use transitions::{PlanChange, TransitionEngine};

use kabuscope_shared::SharedClock;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub quota: Arc<QuotaLedger>,
    pub transitions: Arc<TransitionEngine>,
    pub period_clock: Arc<BillingPeriodClock>,
    pub invariants: Arc<InvariantChecker>,
    pub clock: SharedClock,
}

impl BillingService {
    /// Wire the billing core over the given stores
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        quotas: Arc<dyn QuotaStore>,
        catalog: Arc<PlanCatalog>,
        clock: SharedClock,
        intents: SharedIntentSink,
    ) -> Self {
        Self {
            quota: Arc::new(QuotaLedger::new(
                quotas,
                subscriptions.clone(),
                catalog.clone(),
                clock.clone(),
            )),
            transitions: Arc::new(TransitionEngine::new(
                subscriptions.clone(),
                catalog.clone(),
                clock.clone(),
                intents.clone(),
            )),
            period_clock: Arc::new(BillingPeriodClock::new(
                subscriptions.clone(),
                catalog.clone(),
                clock.clone(),
                intents,
            )),
            invariants: Arc::new(InvariantChecker::new(
                subscriptions,
                catalog.clone(),
                clock.clone(),
            )),
            catalog,
            clock,
        }
    }

    /// Everything in memory, intents logged only. For local runs and tests.
    pub fn in_memory(catalog: Arc<PlanCatalog>, clock: SharedClock) -> Self {
        Self::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryQuotaStore::new()),
            catalog,
            clock,
            Arc::new(LogIntentSink),
        )
    }
}
