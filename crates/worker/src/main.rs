// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kabuscope Background Worker
//!
//! Handles scheduled jobs including:
//! - Billing period sweep (hourly by default, `SWEEP_CRON`)
//! - Subscription invariant check (daily at 03:00 UTC)
//! - Stale quota counter pruning (daily at 00:15 UTC)
//! - Heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use kabuscope_billing::{
    BillingService, ChannelIntentSink, IntentForwarder, LogIntentSink, PgQuotaStore,
    PgSubscriptionStore, PlanCatalog, SharedIntentSink,
};
use kabuscope_shared::{create_pool, run_migrations, SharedClock, SystemClock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

const INTENT_BUFFER: usize = 256;
const INTENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Kabuscope Worker");

    let config = WorkerConfig::from_env()?;

    // Create database pool
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let catalog = Arc::new(match &config.plan_catalog_path {
        Some(path) => PlanCatalog::from_json_file(path)?,
        None => PlanCatalog::builtin(),
    });

    let http_client = reqwest::Client::new();
    let (intents, forwarder) = match &config.billing_intent_webhook_url {
        Some(url) => {
            let (sink, rx) = ChannelIntentSink::channel(INTENT_BUFFER);
            let handle = IntentForwarder::new(http_client, url.clone()).spawn(rx);
            (Arc::new(sink) as SharedIntentSink, Some(handle))
        }
        None => {
            warn!("BILLING_INTENT_WEBHOOK_URL not set, applied changes are logged only");
            (Arc::new(LogIntentSink) as SharedIntentSink, None)
        }
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let billing = BillingService::new(
        Arc::new(PgSubscriptionStore::new(pool.clone())),
        Arc::new(PgQuotaStore::new(pool)),
        catalog,
        clock,
        intents,
    );

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Billing period sweep
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.sweep_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running scheduled billing period sweep");
                jobs::run_sweep(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %config.sweep_cron, "Scheduled: Billing period sweep");

    // Job 2: Subscription invariant check
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_cron.as_str(),
            move |_uuid, _l| {
                let billing = invariant_billing.clone();
                Box::pin(async move {
                    info!("Running subscription invariant check");
                    jobs::run_invariant_check(&billing).await;
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Subscription invariant check");

    // Job 3: Prune quota counters from past windows
    let prune_billing = billing.clone();
    let keep_days = config.quota_keep_days;
    scheduler
        .add(Job::new_async(config.prune_cron.as_str(), move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                jobs::run_quota_prune(&billing, keep_days).await;
            })
        })?)
        .await?;
    info!(
        cron = %config.prune_cron,
        keep_days = keep_days,
        "Scheduled: Quota counter pruning"
    );

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Catch up on anything that came due while the worker was down
    jobs::run_sweep(&billing).await;

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Kabuscope Worker started successfully with 4 scheduled jobs");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal, running until killed");
        std::future::pending::<()>().await;
    }

    info!("Shutting down worker");
    scheduler.shutdown().await?;
    drop(scheduler);
    drop(billing);

    if let Some(forwarder) = forwarder {
        if tokio::time::timeout(INTENT_DRAIN_TIMEOUT, forwarder.shutdown())
            .await
            .is_err()
        {
            warn!("Timed out draining billing intents");
        }
    }

    Ok(())
}
