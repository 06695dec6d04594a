//! Per-request quota enforcement

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use kabuscope_shared::ResourceKind;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Consume one `api_call` unit before the handler runs. Layered inside
/// `require_auth`; a denied request never reaches the handler.
pub async fn require_api_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    request: Request,
    next: Next,
) -> Response {
    match state
        .billing
        .quota
        .check_and_consume(auth_user.user_id, ResourceKind::ApiCall, 1)
        .await
    {
        Ok(grant) => {
            tracing::debug!(
                user_id = %auth_user.user_id,
                remaining = grant.remaining,
                path = %request.uri().path(),
                "api_call quota consumed"
            );
            next.run(request).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}
