//! Application state for the API server.

use std::sync::Arc;

use keyward_core::auth::AuthManager;
use keyward_core::consent::ConsentCoordinator;
use keyward_core::external::ExternalUi;
use keyward_proxy::{Gateway, ProxyError};
use keyward_storage::Database;

use crate::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Record store.
    pub db: Database,
    /// Login sessions and consent tokens.
    pub auth: Arc<AuthManager>,
    /// Register calls waiting for a decision.
    pub consent: ConsentCoordinator,
    /// Metering proxy for application traffic.
    pub gateway: Gateway,
    /// Where consent prompts and the dashboard are opened.
    pub ui: Arc<dyn ExternalUi>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Creates state over `db` for the given local user.
    pub fn new(
        config: ServerConfig,
        db: Database,
        auth: AuthManager,
        ui: Arc<dyn ExternalUi>,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            gateway: Gateway::new(db.clone())?,
            db,
            auth: Arc::new(auth),
            consent: ConsentCoordinator::new(),
            ui,
            config: Arc::new(config),
        })
    }

    /// Base URL this daemon answers on, e.g. `http://127.0.0.1:18760`.
    pub fn local_url(&self) -> String {
        self.config.local_url()
    }
}
