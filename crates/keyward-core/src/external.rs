//! Seams to the operating system.
//!
//! The broker never talks to the desktop directly. Opening the consent UI
//! goes through [`ExternalUi`], and installing or launching the daemon goes
//! through [`ServiceInstaller`].

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

/// Errors from OS collaborators.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("failed to open {url}: {reason}")]
    OpenFailed { url: String, reason: String },

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("failed to launch daemon: {0}")]
    LaunchFailed(String),
}

pub type Result<T> = std::result::Result<T, ExternalError>;

/// Opens a URL in front of the user.
pub trait ExternalUi: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs in the default browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl ExternalUi for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        open::that(url).map_err(|e| ExternalError::OpenFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Logs and remembers URLs instead of opening them.
///
/// For sessions with no browser to launch, such as a login over SSH; the
/// user opens the logged URL by hand. Tests inspect [`HeadlessUi::opened`].
#[derive(Debug, Default)]
pub struct HeadlessUi {
    opened: Mutex<Vec<String>>,
}

impl HeadlessUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs requested so far, oldest first.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl ExternalUi for HeadlessUi {
    fn open(&self, url: &str) -> Result<()> {
        info!(url, "Open this URL to continue");
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}

/// Installs and launches the daemon as a per-user background process.
pub trait ServiceInstaller {
    /// Register the daemon to start with the user session.
    fn elevated_install(&self) -> Result<()>;

    /// Remove the registration.
    fn uninstall(&self) -> Result<()>;

    fn is_installed(&self) -> bool;

    /// Start a detached daemon process now.
    fn launch_persistent_process(&self) -> Result<()>;
}
