//! Plan catalog
//!
//! Plans are immutable once published. A price change ships as a new plan id
//! and the old one is retired (`is_active = false`) so existing subscribers
//! keep resolving it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use kabuscope_shared::ResourceKind;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Value of a plan feature flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Number(i64),
}

/// A subscription tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    /// Monthly price in yen
    pub price_monthly: i64,
    /// Daily ceiling per resource kind; a missing kind means no allowance
    pub quotas: BTreeMap<ResourceKind, u32>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureValue>,
    /// Whether new subscriptions may select this plan
    pub is_active: bool,
}

impl Plan {
    pub fn daily_limit(&self, kind: ResourceKind) -> u32 {
        self.quotas.get(&kind).copied().unwrap_or(0)
    }

    /// Free tier: 200 API calls and 10 analyses per day
    pub fn free() -> Self {
        Self {
            plan_id: "free".to_string(),
            name: "Free".to_string(),
            price_monthly: 0,
            quotas: BTreeMap::from([
                (ResourceKind::ApiCall, 200),
                (ResourceKind::AiAnalysis, 10),
            ]),
            features: BTreeMap::from([
                ("realtime_quotes".to_string(), FeatureValue::Flag(false)),
                ("watchlist_slots".to_string(), FeatureValue::Number(10)),
                ("csv_export".to_string(), FeatureValue::Flag(false)),
            ]),
            is_active: true,
        }
    }

    /// Standard tier: ¥980, 2,000 API calls and 30 analyses per day
    pub fn standard() -> Self {
        Self {
            plan_id: "standard".to_string(),
            name: "Standard".to_string(),
            price_monthly: 980,
            quotas: BTreeMap::from([
                (ResourceKind::ApiCall, 2_000),
                (ResourceKind::AiAnalysis, 30),
            ]),
            features: BTreeMap::from([
                ("realtime_quotes".to_string(), FeatureValue::Flag(true)),
                ("watchlist_slots".to_string(), FeatureValue::Number(50)),
                ("csv_export".to_string(), FeatureValue::Flag(false)),
            ]),
            is_active: true,
        }
    }

    /// Pro tier: ¥2,980, 20,000 API calls and 100 analyses per day
    pub fn pro() -> Self {
        Self {
            plan_id: "pro".to_string(),
            name: "Pro".to_string(),
            price_monthly: 2_980,
            quotas: BTreeMap::from([
                (ResourceKind::ApiCall, 20_000),
                (ResourceKind::AiAnalysis, 100),
            ]),
            features: BTreeMap::from([
                ("realtime_quotes".to_string(), FeatureValue::Flag(true)),
                ("watchlist_slots".to_string(), FeatureValue::Number(500)),
                ("csv_export".to_string(), FeatureValue::Flag(true)),
            ]),
            is_active: true,
        }
    }
}

/// Outcome of comparing two plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanComparison {
    /// True only when the monthly price strictly increases. Equal price is
    /// a lateral move handled like a downgrade (period end, no refund).
    pub is_upgrade: bool,
}

/// Read-only registry of plans
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
    free_plan: Plan,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> BillingResult<Self> {
        if plans.is_empty() {
            return Err(BillingError::InvalidCatalog(
                "catalog must contain at least one plan".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for plan in &plans {
            if plan.plan_id.trim().is_empty() {
                return Err(BillingError::InvalidCatalog(
                    "plan_id must not be empty".to_string(),
                ));
            }
            if !seen.insert(plan.plan_id.clone()) {
                return Err(BillingError::InvalidCatalog(format!(
                    "duplicate plan_id {}",
                    plan.plan_id
                )));
            }
            if plan.price_monthly < 0 {
                return Err(BillingError::InvalidCatalog(format!(
                    "plan {} has a negative price",
                    plan.plan_id
                )));
            }
        }

        let free_plan = plans
            .iter()
            .filter(|p| p.is_active)
            .min_by(|a, b| {
                a.price_monthly
                    .cmp(&b.price_monthly)
                    .then_with(|| a.plan_id.cmp(&b.plan_id))
            })
            .cloned()
            .ok_or_else(|| {
                BillingError::InvalidCatalog("catalog has no active plan".to_string())
            })?;

        let plans = plans.into_iter().map(|p| (p.plan_id.clone(), p)).collect();

        Ok(Self { plans, free_plan })
    }

    /// Catalog shipped with the service: Free, Standard and Pro
    pub fn builtin() -> Self {
        let free_plan = Plan::free();
        let plans = [Plan::free(), Plan::standard(), Plan::pro()]
            .into_iter()
            .map(|p| (p.plan_id.clone(), p))
            .collect();
        Self { plans, free_plan }
    }

    pub fn from_json_str(json: &str) -> BillingResult<Self> {
        let plans: Vec<Plan> = serde_json::from_str(json)?;
        Self::new(plans)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::InvalidCatalog(format!("cannot read {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&json)?;
        tracing::info!(
            path = %path.display(),
            plans = catalog.plans.len(),
            free_plan_id = %catalog.free_plan.plan_id,
            "Loaded plan catalog"
        );
        Ok(catalog)
    }

    pub fn get_plan(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// Active plans by ascending price, ties broken by plan id
    pub fn list_active_plans(&self) -> Vec<&Plan> {
        let mut active: Vec<&Plan> = self.plans.values().filter(|p| p.is_active).collect();
        active.sort_by(|a, b| {
            a.price_monthly
                .cmp(&b.price_monthly)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });
        active
    }

    pub fn compare(&self, from: &Plan, to: &Plan) -> PlanComparison {
        PlanComparison {
            is_upgrade: to.price_monthly > from.price_monthly,
        }
    }

    /// Lowest-priced active plan; cancellations and the no-subscription
    /// fallback land here
    pub fn free_plan(&self) -> &Plan {
        &self.free_plan
    }

    pub fn free_plan_id(&self) -> &str {
        &self.free_plan.plan_id
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
