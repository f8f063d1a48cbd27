//! Consent coordination for application grants.
//!
//! A register request that needs a human decision calls
//! [`ConsentCoordinator::begin`], opens the consent UI, and awaits
//! [`PendingConsent::wait`]. The UI answers through the decision endpoint,
//! which calls [`ConsentCoordinator::resolve`]. Toggling, deleting, or
//! clearing applications resolves every wait for the affected app through
//! [`ConsentCoordinator::resolve_app`].
//!
//! Each pending entry owns a oneshot sender. The sender is removed from the
//! table under the lock before it is used, so at most one resolver ever
//! signals a session. Dropping a [`PendingConsent`] (timeout, or the HTTP
//! request future being dropped on client disconnect) removes its entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// Wait used when the caller does not configure one.
pub const DEFAULT_CONSENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shortest allowed consent wait.
pub const MIN_CONSENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest allowed consent wait.
pub const MAX_CONSENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Consent errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsentError {
    /// Nobody answered before the deadline.
    #[error("consent request timed out")]
    Timeout,

    #[error("invalid consent UI url: {0}")]
    InvalidUiUrl(String),
}

/// Clamp a configured wait into the allowed range.
pub fn clamp_timeout(timeout: Option<Duration>) -> Duration {
    timeout
        .unwrap_or(DEFAULT_CONSENT_TIMEOUT)
        .clamp(MIN_CONSENT_TIMEOUT, MAX_CONSENT_TIMEOUT)
}

struct Waiter {
    app_id: String,
    tx: oneshot::Sender<bool>,
}

type WaiterTable = Arc<Mutex<HashMap<String, Waiter>>>;

/// Table of consent sessions awaiting a decision.
#[derive(Clone, Default)]
pub struct ConsentCoordinator {
    waiters: WaiterTable,
}

impl std::fmt::Debug for ConsentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentCoordinator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ConsentCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a consent session for `app_id`.
    pub fn begin(&self, app_id: &str) -> PendingConsent {
        let session = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.waiters.lock().insert(
            session.clone(),
            Waiter {
                app_id: app_id.to_string(),
                tx,
            },
        );
        debug!(%session, app_id, "Consent session opened");

        PendingConsent {
            session,
            app_id: app_id.to_string(),
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Deliver a decision to one session.
    ///
    /// Returns `false` when the session is unknown or already resolved.
    pub fn resolve(&self, session: &str, approved: bool) -> bool {
        let waiter = self.waiters.lock().remove(session);

        match waiter {
            Some(waiter) => {
                info!(session, app_id = %waiter.app_id, approved, "Consent resolved");
                // The receiver may already be gone if the request just timed out.
                let _ = waiter.tx.send(approved);
                true
            }
            None => {
                debug!(session, "Consent session not pending");
                false
            }
        }
    }

    /// Deliver a decision to every session of `app_id`. Returns how many were
    /// resolved.
    pub fn resolve_app(&self, app_id: &str, approved: bool) -> usize {
        let resolved: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let sessions: Vec<String> = waiters
                .iter()
                .filter(|(_, w)| w.app_id == app_id)
                .map(|(s, _)| s.clone())
                .collect();
            sessions
                .iter()
                .filter_map(|s| waiters.remove(s))
                .collect()
        };

        let count = resolved.len();
        for waiter in resolved {
            let _ = waiter.tx.send(approved);
        }
        if count > 0 {
            info!(app_id, approved, count, "Consent resolved for application");
        }
        count
    }

    /// Resolve every pending session. Used when all applications are cleared.
    pub fn resolve_all(&self, approved: bool) -> usize {
        let drained: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(approved);
        }
        count
    }

    /// The app a pending session belongs to.
    pub fn app_for_session(&self, session: &str) -> Option<String> {
        self.waiters.lock().get(session).map(|w| w.app_id.clone())
    }

    pub fn is_pending(&self, session: &str) -> bool {
        self.waiters.lock().contains_key(session)
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// One open consent session. Removes itself from the table when dropped.
pub struct PendingConsent {
    session: String,
    app_id: String,
    rx: oneshot::Receiver<bool>,
    waiters: WaiterTable,
}

impl PendingConsent {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Wait for the decision, at most `timeout`.
    ///
    /// `Ok(true)` is an approval. A session whose sender vanished without a
    /// decision counts as a denial.
    pub async fn wait(mut self, timeout: Duration) -> Result<bool, ConsentError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(approved)) => Ok(approved),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                info!(session = %self.session, app_id = %self.app_id, "Consent timed out");
                Err(ConsentError::Timeout)
            }
        }
    }
}

impl Drop for PendingConsent {
    fn drop(&mut self) {
        if self.waiters.lock().remove(&self.session).is_some() {
            debug!(session = %self.session, "Consent session abandoned");
        }
    }
}

impl std::fmt::Debug for PendingConsent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConsent")
            .field("session", &self.session)
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Parameters placed in the consent UI URL.
#[derive(Debug, Clone)]
pub struct ConsentPrompt<'a> {
    pub app_id: &'a str,
    pub app_name: &'a str,
    pub app_description: &'a str,
    pub session: &'a str,
    pub token: &'a str,
    pub username: &'a str,
    pub port: u16,
}

/// Build `<ui_base>/action/register?...` for a consent prompt.
pub fn consent_url(ui_base: &str, prompt: &ConsentPrompt<'_>) -> Result<Url, ConsentError> {
    let base = format!("{}/action/register", ui_base.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|e| ConsentError::InvalidUiUrl(e.to_string()))?;

    url.query_pairs_mut()
        .append_pair("action", "register")
        .append_pair("appId", prompt.app_id)
        .append_pair("appName", prompt.app_name)
        .append_pair("appDescription", prompt.app_description)
        .append_pair("session", prompt.session)
        .append_pair("token", prompt.token)
        .append_pair("username", prompt.username)
        .append_pair("port", &prompt.port.to_string());

    Ok(url)
}
