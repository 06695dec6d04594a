//! HTTP routes

mod admin;
mod analysis;
mod subscription;


use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    quota::require_api_quota,
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/subscription/plans", get(subscription::list_plans));

    let subscription_routes = Router::new()
        .route(
            "/subscription/my-subscription",
            get(subscription::my_subscription),
        )
        .route("/subscription/register", post(subscription::register))
        .route("/subscription/upgrade", post(subscription::upgrade))
        .route("/subscription/downgrade", post(subscription::downgrade))
        .route("/subscription/change", post(subscription::change_plan))
        .route("/subscription/cancel", post(subscription::cancel))
        .route(
            "/subscription/pending-change",
            delete(subscription::withdraw_pending_change),
        )
        .route(
            "/subscription/quota/check/{resource_kind}",
            get(subscription::check_quota),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Product routes pay one api_call unit per request on top of their own quota
    let analysis_routes = Router::new()
        .route("/analysis/{ticker}", post(analysis::generate_analysis))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_quota,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/admin/billing/invariants", get(admin::run_invariants))
        .route(
            "/admin/billing/invariants/{check}",
            get(admin::run_invariant),
        )
        .route("/admin/billing/sweep", post(admin::trigger_sweep))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(subscription_routes)
        .merge(analysis_routes)
        .merge(admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
