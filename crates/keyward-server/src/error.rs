//! API error types.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use keyward_core::auth::AuthError;
use keyward_core::consent::ConsentError;
use keyward_proxy::ProxyError;
use keyward_storage::StorageError;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Authentication required.
    #[error("authentication required")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is known but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No consent decision arrived in time.
    #[error("request timed out")]
    Timeout,

    /// The change would break a uniqueness or protection rule.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Bad request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Timeout => "timeout",
            ApiError::Conflict(_) => "conflict",
            ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => ApiError::NotFound(what),
            StorageError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Unauthorized => ApiError::Unauthorized,
            ProxyError::NotFound(id) => ApiError::NotFound(format!("application {id}")),
            ProxyError::Forbidden(name) => ApiError::Forbidden(format!("application {name} is not granted")),
            ProxyError::Internal(msg) => ApiError::Internal(msg),
            ProxyError::UpstreamUnavailable(msg) => ApiError::UpstreamUnavailable(msg),
            ProxyError::Storage(e) => e.into(),
        }
    }
}

impl From<ConsentError> for ApiError {
    fn from(e: ConsentError) -> Self {
        match e {
            ConsentError::Timeout => ApiError::Timeout,
            ConsentError::InvalidUiUrl(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::AuthRequired => ApiError::Unauthorized,
            AuthError::UsernameEmpty | AuthError::PasswordEmpty | AuthError::PasswordTooShort => {
                ApiError::BadRequest(e.to_string())
            }
            AuthError::HashingFailed(_) | AuthError::VerificationFailed(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
