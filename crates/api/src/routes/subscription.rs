//! Subscription and quota routes

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use kabuscope_billing::{
    BillingError, EffectiveDate, Plan, PlanChange, Subscription, TransitionRequest,
    UsageSnapshot,
};
use kabuscope_shared::{ParseResourceKindError, ResourceKind};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
pub struct MySubscriptionResponse {
    /// Absent for users who never registered; they get the free plan
    pub subscription: Option<Subscription>,
    pub plan: Plan,
    pub usage: Vec<UsageSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DowngradeRequest {
    pub plan_id: String,
    #[serde(default)]
    pub effective_date: EffectiveDate,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: String,
    #[serde(default)]
    pub effective_date: EffectiveDate,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
    #[serde(default)]
    pub effective_date: EffectiveDate,
    /// Shorthand for `effective_date: immediate`
    #[serde(default)]
    pub cancel_immediately: bool,
}

impl CancelRequest {
    fn effective_date(&self) -> EffectiveDate {
        if self.cancel_immediately {
            EffectiveDate::Immediate
        } else {
            self.effective_date
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QuotaCheckResponse {
    pub resource_kind: ResourceKind,
    pub has_quota: bool,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub resets_at: OffsetDateTime,
}

impl From<UsageSnapshot> for QuotaCheckResponse {
    fn from(usage: UsageSnapshot) -> Self {
        Self {
            resource_kind: usage.resource,
            has_quota: usage.has_quota(),
            used: usage.used,
            limit: usage.limit,
            remaining: usage.remaining,
            resets_at: usage.resets_at,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Active plans, cheapest first
pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    let plans = state
        .billing
        .catalog
        .list_active_plans()
        .into_iter()
        .cloned()
        .collect();
    Json(PlansResponse { plans })
}

pub async fn my_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MySubscriptionResponse>> {
    let user_id = auth_user.user_id;

    let subscription = match state.billing.transitions.get_current(user_id).await {
        Ok(subscription) => Some(subscription),
        Err(BillingError::NoActiveSubscription(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let plan = state.billing.quota.current_plan(user_id).await?;
    let usage = state.billing.quota.get_all_usage(user_id).await?;

    Ok(Json(MySubscriptionResponse {
        subscription,
        plan,
        usage,
    }))
}

pub async fn register(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state.billing.transitions.register(auth_user.user_id).await?;
    Ok(Json(subscription))
}

pub async fn upgrade(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpgradeRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .transitions
        .upgrade(auth_user.user_id, &req.plan_id)
        .await?;
    Ok(Json(subscription))
}

pub async fn downgrade(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<DowngradeRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .transitions
        .downgrade(auth_user.user_id, &req.plan_id, req.effective_date)
        .await?;
    Ok(Json(subscription))
}

/// Direction is decided by the catalog rather than the caller
pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<PlanChange>> {
    let change = state
        .billing
        .transitions
        .change_plan(auth_user.user_id, &req.plan_id, req.effective_date)
        .await?;
    Ok(Json(change))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Subscription>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    if req.reason.as_ref().is_some_and(|r| r.len() > 1000) {
        return Err(ApiError::Validation(
            "Cancellation reason must be at most 1000 characters".to_string(),
        ));
    }

    let request = TransitionRequest::cancellation(
        auth_user.user_id,
        state.billing.clock.now(),
        req.effective_date(),
        req.reason,
    );
    let subscription = state
        .billing
        .transitions
        .cancel(auth_user.user_id, request)
        .await?;
    Ok(Json(subscription))
}

pub async fn withdraw_pending_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .transitions
        .withdraw_pending_change(auth_user.user_id)
        .await?;
    Ok(Json(subscription))
}

/// Read-only: reports remaining allowance without consuming any
pub async fn check_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(resource_kind): Path<String>,
) -> ApiResult<Json<QuotaCheckResponse>> {
    let resource: ResourceKind = resource_kind
        .parse()
        .map_err(|e: ParseResourceKindError| ApiError::Validation(e.to_string()))?;

    let usage = state
        .billing
        .quota
        .get_usage(auth_user.user_id, resource)
        .await?;
    Ok(Json(usage.into()))
}
