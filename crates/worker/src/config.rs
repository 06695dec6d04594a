//! Worker configuration from the environment

use anyhow::{bail, Context};

/// Top of every hour
const DEFAULT_SWEEP_CRON: &str = "0 0 * * * *";
/// 03:00 UTC
const DEFAULT_INVARIANT_CRON: &str = "0 0 3 * * *";
/// 00:15 UTC, after the quota window has turned over
const DEFAULT_PRUNE_CRON: &str = "0 15 0 * * *";
const DEFAULT_QUOTA_KEEP_DAYS: u32 = 7;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub plan_catalog_path: Option<String>,
    pub billing_intent_webhook_url: Option<String>,
    pub sweep_cron: String,
    pub invariant_cron: String,
    pub prune_cron: String,
    /// Full days of quota counters kept for support lookups
    pub quota_keep_days: u32,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let Some(database_url) = get("DATABASE_URL") else {
            bail!("DATABASE_URL must be set");
        };

        let quota_keep_days = match get("QUOTA_KEEP_DAYS") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("QUOTA_KEEP_DAYS is not a number: {}", value))?,
            None => DEFAULT_QUOTA_KEEP_DAYS,
        };

        Ok(Self {
            database_url,
            plan_catalog_path: get("PLAN_CATALOG_PATH"),
            billing_intent_webhook_url: get("BILLING_INTENT_WEBHOOK_URL"),
            sweep_cron: get("SWEEP_CRON").unwrap_or_else(|| DEFAULT_SWEEP_CRON.to_string()),
            invariant_cron: get("INVARIANT_CRON")
                .unwrap_or_else(|| DEFAULT_INVARIANT_CRON.to_string()),
            prune_cron: get("QUOTA_PRUNE_CRON").unwrap_or_else(|| DEFAULT_PRUNE_CRON.to_string()),
            quota_keep_days,
        })
    }
}
