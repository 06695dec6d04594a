//! Operator billing routes

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use kabuscope_billing::{InvariantCheckSummary, InvariantChecker, InvariantViolation, SweepReport};
use serde::Serialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct InvariantCheckResponse {
    pub check: String,
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

/// Run every consistency check over stored subscriptions
pub async fn run_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    tracing::info!(admin_id = %auth_user.user_id, "Admin invariant check requested");
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

pub async fn run_invariant(
    State(state): State<AppState>,
    Path(check): Path<String>,
) -> ApiResult<Json<InvariantCheckResponse>> {
    if !InvariantChecker::available_checks().contains(&check.as_str()) {
        return Err(ApiError::NotFound(format!("Unknown invariant check: {}", check)));
    }
    let violations = state.billing.invariants.run_check(&check).await?;
    Ok(Json(InvariantCheckResponse {
        passed: violations.is_empty(),
        check,
        violations,
    }))
}

/// Roll due billing periods now, using the server clock
pub async fn trigger_sweep(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SweepReport>> {
    tracing::info!(admin_id = %auth_user.user_id, "Admin billing sweep triggered");
    let report = state.billing.period_clock.sweep_now().await?;
    Ok(Json(report))
}
