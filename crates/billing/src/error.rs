//! Billing error types

use kabuscope_shared::ResourceKind;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("No active subscription for user {0}")]
    NoActiveSubscription(Uuid),

    #[error("Daily {resource} quota exceeded ({used}/{limit}), resets at {resets_at}")]
    QuotaExceeded {
        resource: ResourceKind,
        limit: u32,
        used: u32,
        remaining: u32,
        resets_at: OffsetDateTime,
    },

    #[error("Subscription for user {0} was modified concurrently, please try again")]
    ConcurrentModification(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid plan catalog: {0}")]
    InvalidCatalog(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::ConcurrentModification(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidCatalog(err.to_string())
    }
}
