//! Error types for the gateway.

use keyward_storage::StorageError;
use thiserror::Error;

/// Gateway error type.
///
/// Variants map one-to-one onto HTTP statuses at the server edge.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No `Authorization: Bearer <app id>` header.
    #[error("missing bearer token")]
    Unauthorized,

    #[error("application not found: {0}")]
    NotFound(String),

    #[error("application not granted: {0}")]
    Forbidden(String),

    /// The application is granted but its key cannot be used.
    #[error("{0}")]
    Internal(String),

    /// The upstream provider could not be reached or read.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
