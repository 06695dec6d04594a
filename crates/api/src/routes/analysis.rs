//! AI stock analysis

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use kabuscope_billing::QuotaGrant;
use kabuscope_shared::ResourceKind;
use serde::Serialize;

use crate::{
    analysis::normalize_ticker,
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub ticker: String,
    pub analysis: serde_json::Value,
    /// `ai_analysis` usage after this request
    pub usage: QuotaGrant,
}

/// Generate an analysis report. One `ai_analysis` unit is consumed before
/// the generator runs and is kept even if generation fails.
pub async fn generate_analysis(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(ticker): Path<String>,
) -> ApiResult<Json<AnalysisResponse>> {
    let ticker = normalize_ticker(&ticker)
        .ok_or_else(|| ApiError::Validation(format!("Invalid ticker: {}", ticker)))?;

    let usage = state
        .billing
        .quota
        .check_and_consume(auth_user.user_id, ResourceKind::AiAnalysis, 1)
        .await?;

    let analysis = state
        .analysis
        .generate(auth_user.user_id, &ticker)
        .await
        .map_err(|e| {
            tracing::error!(
                user_id = %auth_user.user_id,
                ticker = %ticker,
                error = %e,
                "Analysis generation failed after quota was consumed"
            );
            ApiError::Upstream(e.to_string())
        })?;

    tracing::info!(
        user_id = %auth_user.user_id,
        ticker = %ticker,
        remaining = usage.remaining,
        "Analysis generated"
    );

    Ok(Json(AnalysisResponse {
        ticker,
        analysis,
        usage,
    }))
}
