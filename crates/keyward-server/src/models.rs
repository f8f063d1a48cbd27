//! API request and response models.
//!
//! Stored records (applications, keys, presets, usage) are returned in their
//! storage shape; only envelopes and request bodies live here.

use serde::{Deserialize, Serialize};

use keyward_storage::{Application, Preset, ProviderKey};

/// Response body for GET /.
#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    #[serde(rename = "__keyward")]
    pub keyward: bool,
    pub version: &'static str,
}

/// Response body for GET /open.
#[derive(Debug, Serialize)]
pub struct OpenResponse {
    pub opened: bool,
}

/// Request body for POST /app/register.
#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Id returned by an earlier registration.
    #[serde(default)]
    pub id: Option<String>,
}

/// Response body for POST /app/register.
#[derive(Debug, Serialize)]
pub struct RegisterAppResponse {
    /// Application id, used as the gateway bearer token.
    pub token: String,
}

/// Request body for POST /app/toggle.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleAppRequest {
    pub id: String,
    pub granted: bool,
    #[serde(default)]
    pub key_id: Option<String>,
}

/// Response body for GET /app/list.
#[derive(Debug, Serialize)]
pub struct AppsResponse {
    pub apps: Vec<Application>,
}

/// Request body for POST /ui/decision.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub session: String,
    /// Consent token from the UI URL; must match `session`.
    #[serde(default)]
    pub token: String,
    pub approved: bool,
    #[serde(default)]
    pub key_id: Option<String>,
}

/// Response body for POST /ui/decision.
#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    /// Whether a waiting register call received the decision.
    pub resolved: bool,
}

/// Response body for GET /keys/list.
#[derive(Debug, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<ProviderKey>,
}

/// Response body for GET /presets/list.
#[derive(Debug, Serialize)]
pub struct PresetsResponse {
    pub presets: Vec<Preset>,
}

/// Response body for deletes.
#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

/// Response body for bulk clears.
#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: usize,
}

/// Query parameters for GET /usage/stats.
///
/// Kept as raw strings so unparsable values fall back to defaults instead of
/// rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<String>,
}

/// Query parameters for GET /usage/list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageListQuery {
    pub page: Option<String>,
    pub page_size: Option<String>,
}

/// Request body for POST /auth/register and POST /auth/login.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

/// Outcome of a login or account registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Success,
    Error,
    NotRegistered,
}

/// Response body for POST /auth/login and POST /auth/register.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: LoginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Session token (only present on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LoginResponse {
    pub fn success(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            status: LoginStatus::Success,
            username: Some(username.into()),
            token: Some(token.into()),
            message: None,
        }
    }

    pub fn failure(status: LoginStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            username: None,
            token: None,
            message: Some(message.into()),
        }
    }
}

/// Response body for POST /auth/logout.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResponse {
    pub logged_out: bool,
}
