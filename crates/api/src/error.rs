//! API error type and its HTTP mapping

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kabuscope_billing::BillingError;
use kabuscope_shared::ResourceKind;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Daily {resource} quota exceeded")]
    QuotaExceeded {
        resource: ResourceKind,
        limit: u32,
        used: u32,
        remaining: u32,
        resets_at: OffsetDateTime,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::PlanNotFound(plan_id) => {
                ApiError::NotFound(format!("Plan not found: {}", plan_id))
            }
            BillingError::NoActiveSubscription(_) => {
                ApiError::NotFound("No active subscription".to_string())
            }
            BillingError::InvalidTransition(msg) => ApiError::InvalidTransition(msg),
            BillingError::InvalidRequest(msg) => ApiError::Validation(msg),
            BillingError::QuotaExceeded {
                resource,
                limit,
                used,
                remaining,
                resets_at,
            } => ApiError::QuotaExceeded {
                resource,
                limit,
                used,
                remaining,
                resets_at,
            },
            BillingError::ConcurrentModification(_) => ApiError::Conflict(
                "Subscription was modified concurrently, please try again".to_string(),
            ),
            BillingError::Database(msg) | BillingError::Cache(msg) => ApiError::Database(msg),
            BillingError::InvalidCatalog(msg) | BillingError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

/// Whole seconds until `resets_at`, never below one
fn retry_after_secs(resets_at: OffsetDateTime) -> i64 {
    (resets_at - OffsetDateTime::now_utc()).whole_seconds().max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::QuotaExceeded {
                resource,
                limit,
                used,
                remaining,
                resets_at,
            } => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                let body = Json(json!({
                    "error": format!("Daily {} quota exceeded", resource),
                    "code": status.as_u16(),
                    "resource_kind": resource,
                    "limit": limit,
                    "used": used,
                    "remaining": remaining,
                    "resets_at": resets_at.format(&Rfc3339).unwrap_or_default(),
                }));
                let mut response = (status, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs(resets_at).to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                response
            }
            other => {
                let (status, message) = match &other {
                    ApiError::Unauthorized => {
                        (StatusCode::UNAUTHORIZED, "Authentication required".to_string())
                    }
                    ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
                    ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
                    ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                    ApiError::InvalidTransition(msg) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
                    }
                    ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
                    ApiError::Upstream(msg) => {
                        tracing::error!(error = %msg, "Upstream service failed");
                        (
                            StatusCode::BAD_GATEWAY,
                            "Analysis service unavailable".to_string(),
                        )
                    }
                    ApiError::Database(msg) | ApiError::Internal(msg) => {
                        tracing::error!(error = %msg, "Request failed");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server error".to_string(),
                        )
                    }
                    ApiError::QuotaExceeded { .. } => (
                        StatusCode::TOO_MANY_REQUESTS,
                        "Quota exceeded".to_string(),
                    ),
                };

                let body = Json(json!({
                    "error": message,
                    "code": status.as_u16()
                }));

                (status, body).into_response()
            }
        }
    }
}
