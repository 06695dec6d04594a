//! Billing intents
//!
//! Every committed plan change is announced to the billing-provider
//! integration as an intent: who, from which plan, to which plan, and when it
//! takes effect. This crate never computes money movement; the integration
//! decides charges, refunds and proration from the intent.
//!
//! Emission is fire-and-forget. A full buffer drops the intent with an error
//! log rather than stalling a quota check or a transition request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

/// What happened to the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Upgrade,
    DowngradeScheduled,
    Downgrade,
    CancellationScheduled,
    Cancellation,
    PendingChangeWithdrawn,
    ScheduledChangeApplied,
}

impl IntentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::Upgrade => "upgrade",
            IntentAction::DowngradeScheduled => "downgrade_scheduled",
            IntentAction::Downgrade => "downgrade",
            IntentAction::CancellationScheduled => "cancellation_scheduled",
            IntentAction::Cancellation => "cancellation",
            IntentAction::PendingChangeWithdrawn => "pending_change_withdrawn",
            IntentAction::ScheduledChangeApplied => "scheduled_change_applied",
        }
    }
}

/// A plan change for the billing provider to act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingIntent {
    /// Stable per intent so the receiver can deduplicate retries
    pub intent_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub action: IntentAction,
    pub from_plan_id: String,
    pub to_plan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Receives intents. Implementations must not block.
pub trait IntentSink: Send + Sync {
    fn emit(&self, intent: BillingIntent);
}

pub type SharedIntentSink = Arc<dyn IntentSink>;

/// Logs intents and drops them. Used when no billing integration is wired.
#[derive(Debug, Default, Clone)]
pub struct LogIntentSink;

impl IntentSink for LogIntentSink {
    fn emit(&self, intent: BillingIntent) {
        tracing::info!(
            intent_id = %intent.intent_id,
            user_id = %intent.user_id,
            action = intent.action.as_str(),
            from_plan_id = %intent.from_plan_id,
            to_plan_id = %intent.to_plan_id,
            effective_at = %intent.effective_at,
            "Billing intent (no integration configured)"
        );
    }
}

/// Queues intents for a background forwarder
#[derive(Debug, Clone)]
pub struct ChannelIntentSink {
    tx: mpsc::Sender<BillingIntent>,
}

impl ChannelIntentSink {
    /// Build a sink and the receiving end. Hand the receiver to
    /// [`IntentForwarder::spawn`] or drain it directly in tests.
    pub fn channel(buffer_size: usize) -> (Self, mpsc::Receiver<BillingIntent>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { tx }, rx)
    }
}

impl IntentSink for ChannelIntentSink {
    fn emit(&self, intent: BillingIntent) {
        if let Err(e) = self.tx.try_send(intent) {
            let intent = match &e {
                mpsc::error::TrySendError::Full(i) | mpsc::error::TrySendError::Closed(i) => i,
            };
            tracing::error!(
                intent_id = %intent.intent_id,
                user_id = %intent.user_id,
                action = intent.action.as_str(),
                error = %e,
                "Dropped billing intent"
            );
        }
    }
}

// =============================================================================
// Webhook forwarder
// =============================================================================

const DELIVERY_ATTEMPTS: usize = 4;

/// Drains queued intents and POSTs each one as JSON to the billing
/// integration, retrying transient failures with backoff.
pub struct IntentForwarder {
    client: reqwest::Client,
    url: String,
}

impl IntentForwarder {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Spawn the forwarder. The task ends once every sender is dropped and
    /// the queue is empty.
    pub fn spawn(self, rx: mpsc::Receiver<BillingIntent>) -> IntentForwarderHandle {
        IntentForwarderHandle {
            task: tokio::spawn(self.run(rx)),
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<BillingIntent>) {
        tracing::info!(url = %self.url, "Billing intent forwarder started");
        while let Some(intent) = rx.recv().await {
            match self.deliver(&intent).await {
                Ok(()) => tracing::debug!(
                    intent_id = %intent.intent_id,
                    action = intent.action.as_str(),
                    "Billing intent delivered"
                ),
                Err(e) => tracing::error!(
                    intent_id = %intent.intent_id,
                    user_id = %intent.user_id,
                    action = intent.action.as_str(),
                    error = %e,
                    "Billing intent delivery failed after retries"
                ),
            }
        }
        tracing::info!("Billing intent forwarder stopped");
    }

    async fn deliver(&self, intent: &BillingIntent) -> Result<(), reqwest::Error> {
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(DELIVERY_ATTEMPTS - 1);

        let client = &self.client;
        let url = self.url.as_str();
        Retry::start(strategy, || async move {
            client
                .post(url)
                .json(intent)
                .send()
                .await?
                .error_for_status()
                .map(|_| ())
        })
        .await
    }
}

/// Handle for the background forwarder task
pub struct IntentForwarderHandle {
    task: tokio::task::JoinHandle<()>,
}

impl IntentForwarderHandle {
    /// Wait for queued intents to be delivered. Drop every sink first.
    pub async fn shutdown(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Billing intent forwarder task failed");
        }
    }
}
