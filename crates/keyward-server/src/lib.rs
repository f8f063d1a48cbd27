//! Keyward Server - HTTP API server.
//!
//! This crate provides the local HTTP surface of the Keyward daemon.
//!
//! ## Endpoints
//!
//! Open:
//! - `GET /` - Identity marker used by discovery
//! - `GET /open` - Open the dashboard
//! - `POST /app/register` - Request access; waits for user consent
//! - `POST /ui/decision` - Consent decision from the UI
//! - `ANY /gateway/{*path}`, `ANY /openai/{*path}` - Metered provider proxy (app bearer)
//! - `POST /auth/register`, `POST /auth/login` - Local account
//!
//! Login required (`Authorization: Bearer <session or consent token>`):
//! - `/app/{toggle,list,delete/{id},clear}`
//! - `/usage/{stats,list,clear}`
//! - `/keys/{list,add,update/{id},delete/{id}}`
//! - `/presets/{list,add,update/{id},delete/{id}}`
//! - `POST /auth/logout`
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keyward_core::auth::{local_username, AuthManager};
//! use keyward_core::external::SystemBrowser;
//! use keyward_server::{AppState, Server, ServerConfig};
//! use keyward_storage::Database;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let state = AppState::new(
//!         config.clone(),
//!         Database::new().unwrap(),
//!         AuthManager::new(local_username()),
//!         Arc::new(SystemBrowser),
//!     )
//!     .unwrap();
//!     Server::with_state(config, state).unwrap().run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod middleware;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, delete, get, post, put};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use keyward_core::consent::{clamp_timeout, DEFAULT_CONSENT_TIMEOUT};

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 18760;

/// Default server host (localhost only for security).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Dashboard and consent UI served by the web frontend.
pub const DEFAULT_UI_URL: &str = "http://localhost:5173";

/// Largest request body accepted, gateway payloads included.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 18760).
    pub port: u16,
    /// Base URL of the dashboard; consent prompts open below it.
    pub ui_base_url: String,
    /// How long a register call waits for a decision.
    pub consent_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ui_base_url: DEFAULT_UI_URL.to_string(),
            consent_timeout: DEFAULT_CONSENT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the dashboard base URL.
    pub fn with_ui_url(mut self, url: impl Into<String>) -> Self {
        self.ui_base_url = url.into();
        self
    }

    /// Sets the consent wait, clamped to 5-60 seconds.
    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = clamp_timeout(Some(timeout));
        self
    }

    /// `http://<host>:<port>`.
    pub fn local_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

impl ServerError {
    /// Whether binding failed because another process holds the port.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ServerError::BindError(_, e) if e.kind() == std::io::ErrorKind::AddrInUse)
    }
}

/// Build the full router over `state`.
pub fn router(state: AppState) -> Router {
    // Permissive CORS for the local dashboard origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/app/toggle", post(handlers::toggle_app))
        .route("/app/list", get(handlers::list_apps))
        .route("/app/delete/{id}", delete(handlers::delete_app))
        .route("/app/clear", delete(handlers::clear_apps))
        .route("/usage/stats", get(handlers::usage_stats))
        .route("/usage/list", get(handlers::usage_list))
        .route("/usage/clear", post(handlers::clear_usage))
        .route("/keys/list", get(handlers::list_keys))
        .route("/keys/add", post(handlers::add_key))
        .route("/keys/update/{id}", put(handlers::update_key))
        .route("/keys/delete/{id}", delete(handlers::delete_key))
        .route("/presets/list", get(handlers::list_presets))
        .route("/presets/add", post(handlers::add_preset))
        .route("/presets/update/{id}", put(handlers::update_preset))
        .route("/presets/delete/{id}", delete(handlers::delete_preset))
        .route("/auth/logout", post(handlers::logout))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_login,
        ));

    Router::new()
        .route("/", get(handlers::identity))
        .route("/open", get(handlers::open_dashboard))
        .route("/app/register", post(handlers::register_app))
        .route("/ui/decision", post(handlers::ui_decision))
        .route("/auth/register", post(handlers::register_account))
        .route("/auth/login", post(handlers::login))
        .route("/gateway/{*path}", any(handlers::gateway))
        .route("/openai/{*path}", any(handlers::gateway))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the listening socket.
    ///
    /// Binding is the point of mutual exclusion between daemons; callers
    /// check [`ServerError::is_addr_in_use`] to detect a running instance.
    pub fn bind(&self) -> std::result::Result<TcpListener, ServerError> {
        let bind_err = |e| ServerError::BindError(self.addr, e);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;

        // Only reuse TIME_WAIT sockets; Windows would also let a second
        // daemon bind a port that is actively listened on.
        #[cfg(not(windows))]
        socket.set_reuse_address(true).map_err(bind_err)?;

        socket.bind(&self.addr.into()).map_err(bind_err)?;
        socket.listen(128).map_err(bind_err)?;

        // Set non-blocking for tokio
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).map_err(bind_err)
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<(), ServerError> {
        info!("Keyward API server listening on {}", self.addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, std::future::pending()).await
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use keyward_core::auth::AuthManager;
    use keyward_core::external::HeadlessUi;
    use keyward_storage::{Database, NewProviderKey};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const USER: &str = "alice";

    struct TestApp {
        state: AppState,
        ui: Arc<HeadlessUi>,
    }

    impl TestApp {
        fn new() -> Self {
            let ui = Arc::new(HeadlessUi::new());
            let config = ServerConfig::default().with_consent_timeout(Duration::from_secs(5));
            let state = AppState::new(
                config,
                Database::in_memory().unwrap(),
                AuthManager::new(USER),
                ui.clone(),
            )
            .unwrap();
            Self { state, ui }
        }

        fn router(&self) -> Router {
            router(self.state.clone())
        }

        fn session(&self) -> String {
            self.state.auth.create_session(USER).as_str().to_string()
        }

        async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            let request = if body.is_null() {
                builder.body(Body::empty()).unwrap()
            } else {
                builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap()
            };

            let response = self.router().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, json)
        }

        /// Session id and consent token from the last consent URL opened.
        async fn next_consent(&self) -> (String, String) {
            for _ in 0..200 {
                if let Some(url) = self.ui.opened().last() {
                    return (query_param(url, "session"), query_param(url, "token"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("consent UI was never opened");
        }
    }

    fn query_param(url: &str, name: &str) -> String {
        let prefix = format!("{name}=");
        url.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(prefix.as_str()))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_identity_marker() {
        let app = TestApp::new();
        let (status, body) = app.call("GET", "/", None, Value::Null).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["__keyward"], true);
        assert_eq!(body["version"], keyward_core::VERSION);
    }

    #[tokio::test]
    async fn test_dashboard_routes_require_login() {
        let app = TestApp::new();

        for (method, uri) in [
            ("GET", "/app/list"),
            ("GET", "/keys/list"),
            ("GET", "/presets/list"),
            ("GET", "/usage/stats"),
            ("POST", "/usage/clear"),
            ("DELETE", "/app/clear"),
        ] {
            let (status, body) = app.call(method, uri, None, Value::Null).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
            assert_eq!(body["code"], "unauthorized");
        }

        let (status, _) = app.call("GET", "/app/list", Some("bogus"), Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_consent_token_authorizes_local_user() {
        let app = TestApp::new();
        let token = app.state.auth.issue_consent_token("some-session");

        let (status, body) = app.call("GET", "/keys/list", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["keys"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_account_register_login_logout() {
        let app = TestApp::new();

        let (_, body) = app
            .call("POST", "/auth/login", None, json!({"username": USER, "password": "secret123"}))
            .await;
        assert_eq!(body["status"], "not_registered");

        let (status, body) = app
            .call("POST", "/auth/register", None, json!({"username": USER, "password": "short"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");

        let (status, body) = app
            .call("POST", "/auth/register", None, json!({"username": USER, "password": "secret123"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let (status, _) = app
            .call("POST", "/auth/register", None, json!({"username": "bob", "password": "secret123"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = app
            .call("POST", "/auth/login", None, json!({"username": USER, "password": "wrong-pass"}))
            .await;
        assert_eq!(body["status"], "error");

        let (_, body) = app
            .call("POST", "/auth/login", None, json!({"username": USER, "password": "secret123"}))
            .await;
        assert_eq!(body["status"], "success");
        let token = body["token"].as_str().unwrap().to_string();

        let (status, body) = app.call("POST", "/auth/logout", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loggedOut"], true);

        let (status, _) = app.call("GET", "/app/list", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_register_invalid_body_is_bad_request() {
        let app = TestApp::new();
        let (status, body) = app
            .call("POST", "/app/register", None, json!({"description": "no name"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");

        let (status, _) = app
            .call("POST", "/app/register", None, json!({"name": "  "}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_approve_then_idempotent_reregister() {
        let app = TestApp::new();
        let session = app.session();
        let key = app
            .state
            .db
            .add_key(NewProviderKey {
                name: "openai".into(),
                kind: "manual".into(),
                protocol: "openai".into(),
                base_url: "https://api.example.com/v1/".into(),
                token: "sk-real".into(),
            })
            .unwrap();

        let waiting = {
            let app_router = app.router();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/app/register")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "demo", "description": "test app"}).to_string()))
                    .unwrap();
                let response = app_router.oneshot(request).await.unwrap();
                let status = response.status();
                let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
                (status, serde_json::from_slice::<Value>(&bytes).unwrap())
            })
        };

        let (consent_session, consent_token) = app.next_consent().await;
        let opened = app.ui.opened();
        assert!(opened[0].starts_with("http://localhost:5173/action/register?action=register"));
        assert!(opened[0].contains("appName=demo"));
        assert!(opened[0].contains("username=alice"));
        assert!(opened[0].contains("port=18760"));

        let (status, body) = app
            .call(
                "POST",
                "/ui/decision",
                None,
                json!({
                    "session": consent_session,
                    "token": consent_token,
                    "approved": true,
                    "keyId": key.id
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], true);

        let (status, body) = waiting.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let app_id = body["token"].as_str().unwrap().to_string();

        let stored = app.state.db.get_app(&app_id).unwrap();
        assert!(stored.granted);
        assert_eq!(stored.bound_key_id.as_deref(), Some(key.id.as_str()));

        // Second decision for the same session is a no-op
        let (_, body) = app
            .call(
                "POST",
                "/ui/decision",
                None,
                json!({"session": consent_session, "token": consent_token, "approved": false}),
            )
            .await;
        assert_eq!(body["resolved"], false);

        // Re-registering with the granted id needs no prompt
        let (status, body) = app
            .call("POST", "/app/register", None, json!({"name": "demo", "id": app_id}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token"], app_id.as_str());
        assert_eq!(app.ui.opened().len(), 1);

        let (_, body) = app.call("GET", "/app/list", Some(&session), Value::Null).await;
        assert_eq!(body["apps"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_denied_is_forbidden() {
        let app = TestApp::new();

        let waiting = {
            let app_router = app.router();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/app/register")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "demo"}).to_string()))
                    .unwrap();
                app_router.oneshot(request).await.unwrap().status()
            })
        };

        let (consent_session, consent_token) = app.next_consent().await;
        app.call(
            "POST",
            "/ui/decision",
            None,
            json!({"session": consent_session, "token": consent_token, "approved": false}),
        )
        .await;

        assert_eq!(waiting.await.unwrap(), StatusCode::FORBIDDEN);

        let apps = app.state.db.list_apps().unwrap();
        assert_eq!(apps.len(), 1);
        assert!(!apps[0].granted);
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_consent() {
        let app = TestApp::new();
        let session = app.session();

        let waiting = {
            let app_router = app.router();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/app/register")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "demo"}).to_string()))
                    .unwrap();
                app_router.oneshot(request).await.unwrap().status()
            })
        };

        app.next_consent().await;
        let app_id = app.state.db.list_apps().unwrap()[0].id.clone();

        let (status, _) = app
            .call("DELETE", &format!("/app/delete/{app_id}"), Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(waiting.await.unwrap(), StatusCode::FORBIDDEN);
        assert_eq!(app.state.consent.pending_count(), 0);

        let (status, body) = app
            .call("DELETE", &format!("/app/delete/{app_id}"), Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_decision_for_unknown_session() {
        let app = TestApp::new();
        let token = app.state.auth.issue_consent_token("nope");
        let (status, body) = app
            .call(
                "POST",
                "/ui/decision",
                None,
                json!({"session": "nope", "token": token, "approved": true}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], false);
    }

    #[tokio::test]
    async fn test_decision_requires_matching_consent_token() {
        let app = TestApp::new();

        let waiting = {
            let app_router = app.router();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/app/register")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "demo"}).to_string()))
                    .unwrap();
                app_router.oneshot(request).await.unwrap().status()
            })
        };

        let (consent_session, consent_token) = app.next_consent().await;

        let (status, body) = app
            .call("POST", "/ui/decision", None, json!({"session": consent_session, "approved": true}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let other_token = app.state.auth.issue_consent_token("another-session");
        let (status, _) = app
            .call(
                "POST",
                "/ui/decision",
                None,
                json!({"session": consent_session, "token": other_token, "approved": true}),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app.state.consent.is_pending(&consent_session));

        let (status, body) = app
            .call(
                "POST",
                "/ui/decision",
                None,
                json!({"session": consent_session, "token": consent_token, "approved": false}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], true);
        assert_eq!(waiting.await.unwrap(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_toggle_unknown_app_is_not_found() {
        let app = TestApp::new();
        let session = app.session();
        let (status, _) = app
            .call("POST", "/app/toggle", Some(&session), json!({"id": "nope", "granted": true}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_key_ids_rejected() {
        let app = TestApp::new();
        let session = app.session();

        let waiting = {
            let app_router = app.router();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/app/register")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "demo"}).to_string()))
                    .unwrap();
                app_router.oneshot(request).await.unwrap().status()
            })
        };

        let (consent_session, consent_token) = app.next_consent().await;
        let app_id = app.state.db.list_apps().unwrap()[0].id.clone();

        let (status, body) = app
            .call(
                "POST",
                "/app/toggle",
                Some(&session),
                json!({"id": app_id, "granted": true, "keyId": "nope"}),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        // An approval naming a missing key is stored as a denial
        app.call(
            "POST",
            "/ui/decision",
            None,
            json!({
                "session": consent_session,
                "token": consent_token,
                "approved": true,
                "keyId": "nope"
            }),
        )
        .await;
        assert_eq!(waiting.await.unwrap(), StatusCode::FORBIDDEN);

        let stored = app.state.db.get_app(&app_id).unwrap();
        assert!(!stored.granted);
        assert_eq!(stored.bound_key_id, None);

        let (status, _) = app
            .call("POST", "/presets/add", Some(&session), json!({"name": "ghosts", "keyIds": ["nope"]}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_key_and_preset_crud() {
        let app = TestApp::new();
        let session = app.session();

        let (status, key) = app
            .call(
                "POST",
                "/keys/add",
                Some(&session),
                json!({
                    "name": "openai",
                    "type": "manual",
                    "protocol": "openai",
                    "baseUrl": "https://api.openai.com/v1",
                    "token": "sk-test"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let key_id = key["id"].as_str().unwrap().to_string();

        let (status, preset) = app
            .call("POST", "/presets/add", Some(&session), json!({"name": "work", "keyIds": [key_id]}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let preset_id = preset["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .call("POST", "/presets/add", Some(&session), json!({"name": "work"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, _) = app
            .call("DELETE", "/presets/delete/default", Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app
            .call("DELETE", &format!("/keys/delete/{key_id}"), Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = app.call("GET", "/presets/list", Some(&session), Value::Null).await;
        let work = body["presets"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["id"] == preset_id.as_str())
            .unwrap()
            .clone();
        assert!(work["keyIds"].as_array().unwrap().is_empty());

        let (status, _) = app
            .call(
                "PUT",
                "/keys/update/missing",
                Some(&session),
                json!({"name": "x", "type": "manual", "protocol": "openai", "baseUrl": "https://x", "token": "t"}),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_usage_endpoints_fall_back_on_bad_params() {
        let app = TestApp::new();
        let session = app.session();

        let (status, body) = app
            .call("GET", "/usage/stats?days=abc", Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 0);

        let (status, body) = app
            .call("GET", "/usage/list?page=0&pageSize=999", Some(&session), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page"], 1);
        assert_eq!(body["pageSize"], 50);

        let (status, body) = app.call("POST", "/usage/clear", Some(&session), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 0);
    }

    #[tokio::test]
    async fn test_gateway_rejects_unknown_bearer() {
        let app = TestApp::new();

        let (status, body) = app
            .call("POST", "/gateway/chat/completions", None, json!({"model": "gpt-4"}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, body) = app
            .call("POST", "/openai/chat/completions", Some("no-such-app"), json!({"model": "gpt-4"}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_open_dashboard() {
        let app = TestApp::new();
        let (status, body) = app.call("GET", "/open", None, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["opened"], true);
        assert_eq!(app.ui.opened(), vec![DEFAULT_UI_URL.to_string()]);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.local_url(), "http://127.0.0.1:18760");
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::default()
            .with_port(9000)
            .with_ui_url("https://ui.example")
            .with_consent_timeout(Duration::from_secs(1));
        assert_eq!(config.port, 9000);
        assert_eq!(config.ui_base_url, "https://ui.example");
        assert_eq!(config.consent_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_second_bind_reports_addr_in_use() {
        let app = TestApp::new();
        let first = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();

        let config = ServerConfig::default().with_port(port);
        let server = Server::with_state(config, app.state.clone()).unwrap();
        let err = server.bind().unwrap_err();
        assert!(err.is_addr_in_use());
    }
}
