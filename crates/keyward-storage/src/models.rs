//! Data models for storage.
//!
//! Every model is stored as a camelCase JSON document, which is also its wire
//! shape on the HTTP API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id and name of the preset created with every store.
pub const DEFAULT_PRESET_ID: &str = "default";

/// A third-party application known to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Also the bearer token the application presents to the gateway.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Provider key used for this application's traffic.
    #[serde(default)]
    pub bound_key_id: Option<String>,
    #[serde(default)]
    pub granted: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Parameters of a register call.
#[derive(Debug, Clone, Default)]
pub struct RegisterApp {
    /// Previously issued id, if the caller has one.
    pub id: Option<String>,
    pub name: String,
    pub description: String,
}

/// Outcome of [`crate::Database::register_app`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The id is already granted; no consent needed.
    Granted(Application),
    /// The application was stored ungranted and awaits a decision.
    Pending(Application),
}

/// An upstream provider credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderKey {
    pub id: String,
    pub name: String,
    /// How the key was obtained, e.g. `manual`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Wire protocol spoken by the provider, e.g. `openai`.
    pub protocol: String,
    pub base_url: String,
    pub token: String,
}

/// Fields of a key supplied on add or update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProviderKey {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub base_url: String,
    pub token: String,
}

/// A named, ordered group of provider keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub key_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preset {
    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_PRESET_ID
    }
}

/// Fields of a preset supplied on add or update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPreset {
    pub name: String,
    #[serde(default, alias = "providers")]
    pub key_ids: Vec<String>,
}

/// Outcome of one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Error,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Error => "error",
        }
    }
}

/// One metered gateway call. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// `YYYYMMDDHHMMSSmmm` plus six random characters.
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    pub key_name: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Estimated USD.
    pub cost: f64,
    pub endpoint: String,
    pub status: UsageStatus,
    pub timestamp: DateTime<Utc>,
}

/// Parameters for appending a usage record.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub app_id: String,
    pub app_name: String,
    pub key_name: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub endpoint: String,
    pub status: UsageStatus,
}

/// Usage aggregated per application.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUsage {
    pub app_name: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
}

/// Usage aggregated per key name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsage {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
}

/// Usage aggregated per `key/model` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub key: String,
    pub model: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
}

/// Ledger statistics over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_requests: u64,
    pub by_app: BTreeMap<String, AppUsage>,
    pub by_key: BTreeMap<String, KeyUsage>,
    pub by_model: BTreeMap<String, ModelUsage>,
    /// Newest first, at most [`RECENT_USAGE_LIMIT`].
    pub recent_usages: Vec<UsageRecord>,
}

/// Records kept in [`UsageStats::recent_usages`].
pub const RECENT_USAGE_LIMIT: usize = 100;

/// One page of the ledger, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePage {
    pub records: Vec<UsageRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// The local dashboard account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}
