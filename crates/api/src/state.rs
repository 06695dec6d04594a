//! Application state

use std::sync::Arc;

use anyhow::Context;
use kabuscope_billing::{
    BillingService, ChannelIntentSink, InMemoryQuotaStore, InMemorySubscriptionStore,
    IntentForwarder, IntentForwarderHandle, LogIntentSink, PgQuotaStore, PgSubscriptionStore,
    PlanCatalog, QuotaStore, RedisQuotaStore, SharedIntentSink, SubscriptionStore,
};
use kabuscope_shared::{create_pool, run_migrations, SharedClock, SystemClock};
use reqwest::Client;

use crate::{
    analysis::{HttpAnalysisGenerator, SharedAnalysisGenerator, UnavailableAnalysisGenerator},
    auth::JwtManager,
    config::{Config, QuotaBackend},
};

const INTENT_BUFFER: usize = 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: BillingService,
    /// Opaque collaborator behind `/analysis`
    pub analysis: SharedAnalysisGenerator,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService, analysis: SharedAnalysisGenerator) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            jwt_manager,
            billing,
            analysis,
        }
    }

    /// Connect the configured stores and collaborators.
    ///
    /// The returned handle, when present, drains pending billing intents on
    /// shutdown.
    pub async fn connect(config: Config) -> anyhow::Result<(Self, Option<IntentForwarderHandle>)> {
        let http_client = Client::new();

        let catalog = Arc::new(match &config.plan_catalog_path {
            Some(path) => PlanCatalog::from_json_file(path)
                .with_context(|| format!("loading plan catalog from {}", path))?,
            None => {
                tracing::info!("PLAN_CATALOG_PATH not set, using built-in plans");
                PlanCatalog::builtin()
            }
        });

        let pool = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to database...");
                let pool = create_pool(url).await?;
                run_migrations(&pool).await?;
                tracing::info!("Database connection established");
                Some(pool)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, subscriptions are kept in memory");
                None
            }
        };

        let subscriptions: Arc<dyn SubscriptionStore> = match &pool {
            Some(pool) => Arc::new(PgSubscriptionStore::new(pool.clone())),
            None => Arc::new(InMemorySubscriptionStore::new()),
        };

        let quotas: Arc<dyn QuotaStore> = match config.quota_backend {
            QuotaBackend::Memory => Arc::new(InMemoryQuotaStore::new()),
            QuotaBackend::Postgres => {
                let pool = pool
                    .clone()
                    .context("QUOTA_BACKEND=postgres requires DATABASE_URL")?;
                Arc::new(PgQuotaStore::new(pool))
            }
            QuotaBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("QUOTA_BACKEND=redis requires REDIS_URL")?;
                Arc::new(RedisQuotaStore::connect(url).await?)
            }
        };
        tracing::info!(backend = ?config.quota_backend, "Quota store ready");

        let (intents, forwarder) = match &config.billing_intent_webhook_url {
            Some(url) => {
                let (sink, rx) = ChannelIntentSink::channel(INTENT_BUFFER);
                let handle = IntentForwarder::new(http_client.clone(), url.clone()).spawn(rx);
                tracing::info!("Billing intents forwarded to webhook");
                (Arc::new(sink) as SharedIntentSink, Some(handle))
            }
            None => {
                tracing::info!("BILLING_INTENT_WEBHOOK_URL not set, billing intents are logged only");
                (Arc::new(LogIntentSink) as SharedIntentSink, None)
            }
        };

        let clock: SharedClock = Arc::new(SystemClock);
        let billing = BillingService::new(subscriptions, quotas, catalog, clock, intents);

        let analysis: SharedAnalysisGenerator = match &config.analysis_service_url {
            Some(url) => Arc::new(HttpAnalysisGenerator::new(http_client.clone(), url)),
            None => {
                tracing::warn!("ANALYSIS_SERVICE_URL not set, analysis requests will fail");
                Arc::new(UnavailableAnalysisGenerator)
            }
        };

        Ok((Self::new(config, billing, analysis), forwarder))
    }
}
