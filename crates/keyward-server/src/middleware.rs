//! Login guard for dashboard routes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use keyward_core::auth::SessionToken;

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated dashboard user and the credential they presented.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub token: SessionToken,
}

/// Reject requests without a live session or consent token.
///
/// On success the caller is available to handlers as
/// `Extension<CurrentUser>`.
pub async fn require_login(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    let Some(username) = state.auth.authenticate(&bearer) else {
        return ApiError::Unauthorized.into_response();
    };

    request.extensions_mut().insert(CurrentUser {
        username,
        token: SessionToken::from_string(bearer),
    });
    next.run(request).await
}
