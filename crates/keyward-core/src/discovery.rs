//! Singleton discovery.
//!
//! The running daemon advertises itself in `<data dir>/service.json`. A new
//! invocation reads that descriptor and probes the advertised URL; only a
//! positive identity response counts as a live instance. Anything else
//! (missing file, garbage, `url: null`, dead or foreign listener) means the
//! caller should start a daemon itself.
//!
//! The descriptor is advisory. Binding the service port is what actually
//! keeps two daemons apart.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Descriptor file name inside the data directory.
pub const SERVICE_FILE: &str = "service.json";

/// Environment variable overriding the data directory.
pub const ROOT_ENV: &str = "KEYWARD_ROOT";

/// JSON key the identity endpoint sets to `true`.
pub const IDENTITY_KEY: &str = "__keyward";

/// How long a liveness probe may take.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not determine the data directory")]
    NoDataDir,

    #[error("descriptor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Contents of the descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub command_line: String,
    pub pid: u32,
    /// Base URL of the serving instance; `None` once it has shut down.
    pub url: Option<String>,
    /// Unix milliseconds of the last write.
    pub timestamp: i64,
}

impl DiscoveryRecord {
    fn for_current_process(url: Option<String>) -> Self {
        Self {
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            pid: std::process::id(),
            url,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Outcome of [`Discovery::claim_or_detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Another instance answers at this URL.
    Active(String),
    /// No live instance; this process should become the daemon.
    ShouldStart,
}

/// Resolve the data directory: `KEYWARD_ROOT`, else the platform data dir.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }

    ProjectDirs::from("dev", "keyward", "Keyward")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(DiscoveryError::NoDataDir)
}

/// Reads, probes, and writes the service descriptor.
#[derive(Debug, Clone)]
pub struct Discovery {
    path: PathBuf,
    client: reqwest::Client,
}

impl Discovery {
    /// Use the descriptor at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            path: path.into(),
            client,
        })
    }

    /// Use `<dir>/service.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::new(dir.as_ref().join(SERVICE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the descriptor. Missing or unparsable files read as `None`.
    pub fn read(&self) -> Option<DiscoveryRecord> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = ?self.path, error = %e, "No service descriptor");
                return None;
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Ignoring unparsable service descriptor");
                None
            }
        }
    }

    /// Decide whether a live instance already serves this user.
    pub async fn claim_or_detect(&self) -> Detection {
        let Some(record) = self.read() else {
            return Detection::ShouldStart;
        };

        let Some(url) = record.url.filter(|u| !u.is_empty()) else {
            debug!(pid = record.pid, "Previous instance retired");
            return Detection::ShouldStart;
        };

        if self.probe(&url).await {
            info!(%url, pid = record.pid, "Found running instance");
            Detection::Active(url)
        } else {
            debug!(%url, pid = record.pid, "Stale service descriptor");
            Detection::ShouldStart
        }
    }

    /// `true` when `url` answers with the identity marker.
    pub async fn probe(&self, url: &str) -> bool {
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(url, status = %response.status(), "Probe rejected");
                return false;
            }
            Err(e) => {
                debug!(url, error = %e, "Probe failed");
                return false;
            }
        };

        match response.json::<serde_json::Value>().await {
            Ok(body) => body.get(IDENTITY_KEY).and_then(|v| v.as_bool()) == Some(true),
            Err(_) => false,
        }
    }

    /// Advertise this process as serving at `url`.
    pub fn announce(&self, url: &str) -> Result<()> {
        let record = DiscoveryRecord::for_current_process(Some(url.to_string()));
        self.write(&record)?;
        info!(url, path = ?self.path, "Service descriptor written");
        Ok(())
    }

    /// Mark this instance as no longer serving.
    pub fn retire(&self) -> Result<()> {
        self.write(&DiscoveryRecord::for_current_process(None))?;
        info!(path = ?self.path, "Service descriptor retired");
        Ok(())
    }

    fn write(&self, record: &DiscoveryRecord) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| SERVICE_FILE.to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(record)?)?;
            file.sync_all()?;
        }

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
