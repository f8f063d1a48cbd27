//! API route handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use axum::{Extension, Json};
use bytes::Bytes;
use tracing::{debug, info, warn};

use keyward_core::auth::AuthManager;
use keyward_core::consent::{consent_url, ConsentPrompt};
use keyward_proxy::GatewayRequest;
use keyward_storage::{
    Application, NewPreset, NewProviderKey, Preset, ProviderKey, RegisterApp, Registration,
    UsagePage, UsageStats,
};

use crate::error::{ApiError, Result};
use crate::middleware::CurrentUser;
use crate::models::{
    AppsResponse, ClearedResponse, CredentialsRequest, DecisionRequest, DecisionResponse,
    DeletedResponse, IdentityResponse, KeysResponse, LoginResponse, LoginStatus, LogoutResponse,
    OpenResponse, PresetsResponse, RegisterAppRequest, RegisterAppResponse, StatsQuery,
    ToggleAppRequest, UsageListQuery,
};
use crate::state::AppState;

/// GET / - Identity marker probed by discovery.
pub async fn identity() -> Json<IdentityResponse> {
    Json(IdentityResponse {
        keyward: true,
        version: keyward_core::VERSION,
    })
}

/// GET /open - Open the dashboard in front of the user.
pub async fn open_dashboard(State(state): State<AppState>) -> Result<Json<OpenResponse>> {
    state
        .ui
        .open(&state.config.ui_base_url)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(OpenResponse { opened: true }))
}

// === Applications ===

/// POST /app/register - Request access for an application.
///
/// Returns at once for an already granted id. Otherwise stores the
/// application as pending, opens the consent UI, and holds the response
/// until a decision arrives or the wait times out.
pub async fn register_app(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegisterAppRequest>, JsonRejection>,
) -> Result<Json<RegisterAppResponse>> {
    let Json(req) = payload?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let registration = state.db.register_app(&RegisterApp {
        id: req.id,
        name: req.name,
        description: req.description,
    })?;

    let app = match registration {
        Registration::Granted(app) => {
            debug!(app_id = %app.id, "Application already granted");
            return Ok(Json(RegisterAppResponse { token: app.id }));
        }
        Registration::Pending(app) => app,
    };

    let pending = state.consent.begin(&app.id);
    let token = state.auth.issue_consent_token(pending.session());
    let url = consent_url(
        &state.config.ui_base_url,
        &ConsentPrompt {
            app_id: &app.id,
            app_name: &app.name,
            app_description: &app.description,
            session: pending.session(),
            token: &token,
            username: state.auth.local_user(),
            port: state.config.port,
        },
    )?;

    if let Err(e) = state.ui.open(url.as_str()) {
        warn!(error = %e, app = %app.name, "Failed to open consent UI");
    }
    info!(app_id = %app.id, app = %app.name, "Waiting for consent");

    if pending.wait(state.config.consent_timeout).await? {
        Ok(Json(RegisterAppResponse { token: app.id }))
    } else {
        Err(ApiError::Forbidden(format!("access denied for {}", app.name)))
    }
}

/// POST /app/toggle - Grant or revoke an application.
pub async fn toggle_app(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ToggleAppRequest>, JsonRejection>,
) -> Result<Json<Application>> {
    let Json(req) = payload?;
    let app = state
        .db
        .toggle_app(&req.id, req.granted, req.key_id.as_deref())?;

    state.consent.resolve_app(&app.id, req.granted);
    info!(app_id = %app.id, granted = app.granted, "Application toggled");
    Ok(Json(app))
}

/// GET /app/list
pub async fn list_apps(State(state): State<AppState>) -> Result<Json<AppsResponse>> {
    Ok(Json(AppsResponse {
        apps: state.db.list_apps()?,
    }))
}

/// DELETE /app/delete/{id}
pub async fn delete_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    state.db.delete_app(&id)?;
    state.consent.resolve_app(&id, false);
    info!(app_id = %id, "Application deleted");
    Ok(Json(DeletedResponse { deleted: true }))
}

/// DELETE /app/clear
pub async fn clear_apps(State(state): State<AppState>) -> Result<Json<ClearedResponse>> {
    let removed = state.db.clear_apps()?;
    state.consent.resolve_all(false);
    info!(count = removed.len(), "Applications cleared");
    Ok(Json(ClearedResponse {
        cleared: removed.len(),
    }))
}

/// POST /ui/decision - Deliver the user's consent decision.
///
/// Requires the consent token minted for the session (401 otherwise). Then
/// always 200; `resolved` tells whether a register call was waiting.
pub async fn ui_decision(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<Json<DecisionResponse>> {
    let Json(req) = payload?;

    if !state.auth.verify_consent_token(&req.token, &req.session) {
        debug!(session = %req.session, "Decision without a valid consent token");
        return Err(ApiError::Unauthorized);
    }

    let Some(app_id) = state.consent.app_for_session(&req.session) else {
        debug!(session = %req.session, "Decision for unknown session");
        return Ok(Json(DecisionResponse { resolved: false }));
    };

    // Persist first so the waiting register call returns a usable id.
    let approved = match state.db.decide_app(&app_id, req.approved, req.key_id.as_deref()) {
        Ok(_) => req.approved,
        Err(e) => {
            warn!(error = %e, %app_id, "Failed to store consent decision");
            false
        }
    };

    Ok(Json(DecisionResponse {
        resolved: state.consent.resolve(&req.session, approved),
    }))
}

// === Gateway ===

/// ANY /gateway/{*path} and /openai/{*path} - Forward to the bound provider.
pub async fn gateway(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let response = state
        .gateway
        .forward(GatewayRequest {
            method,
            path,
            query,
            headers,
            body,
        })
        .await?;
    Ok(response)
}

// === Usage ===

/// GET /usage/stats?days=N
pub async fn usage_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<UsageStats>> {
    let days = parse_or(query.days.as_deref(), 0);
    Ok(Json(state.db.usage_stats(days)?))
}

/// GET /usage/list?page=N&pageSize=M
pub async fn usage_list(
    State(state): State<AppState>,
    Query(query): Query<UsageListQuery>,
) -> Result<Json<UsagePage>> {
    let page = parse_or(query.page.as_deref(), 1);
    let page_size = parse_or(query.page_size.as_deref(), 0);
    Ok(Json(state.db.usage_list(page, page_size)?))
}

/// POST /usage/clear
pub async fn clear_usage(State(state): State<AppState>) -> Result<Json<ClearedResponse>> {
    Ok(Json(ClearedResponse {
        cleared: state.db.clear_usage()?,
    }))
}

fn parse_or(value: Option<&str>, default: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// === Provider keys ===

/// GET /keys/list
pub async fn list_keys(State(state): State<AppState>) -> Result<Json<KeysResponse>> {
    Ok(Json(KeysResponse {
        keys: state.db.list_keys()?,
    }))
}

/// POST /keys/add
pub async fn add_key(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewProviderKey>, JsonRejection>,
) -> Result<Json<ProviderKey>> {
    let Json(new) = payload?;
    validate_key(&new)?;
    Ok(Json(state.db.add_key(new)?))
}

/// PUT /keys/update/{id}
pub async fn update_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<NewProviderKey>, JsonRejection>,
) -> Result<Json<ProviderKey>> {
    let Json(new) = payload?;
    validate_key(&new)?;
    Ok(Json(state.db.update_key(&id, new)?))
}

/// DELETE /keys/delete/{id} - Also unbinds the key everywhere.
pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    state.db.delete_key(&id)?;
    Ok(Json(DeletedResponse { deleted: true }))
}

fn validate_key(key: &NewProviderKey) -> Result<()> {
    if key.name.trim().is_empty() {
        return Err(ApiError::BadRequest("key name is required".to_string()));
    }
    if key.base_url.trim().is_empty() {
        return Err(ApiError::BadRequest("baseUrl is required".to_string()));
    }
    Ok(())
}

// === Presets ===

/// GET /presets/list - Most recently updated first.
pub async fn list_presets(State(state): State<AppState>) -> Result<Json<PresetsResponse>> {
    Ok(Json(PresetsResponse {
        presets: state.db.list_presets()?,
    }))
}

/// POST /presets/add
pub async fn add_preset(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewPreset>, JsonRejection>,
) -> Result<Json<Preset>> {
    let Json(new) = payload?;
    validate_preset(&new)?;
    Ok(Json(state.db.add_preset(new)?))
}

/// PUT /presets/update/{id}
pub async fn update_preset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<NewPreset>, JsonRejection>,
) -> Result<Json<Preset>> {
    let Json(new) = payload?;
    validate_preset(&new)?;
    Ok(Json(state.db.update_preset(&id, new)?))
}

/// DELETE /presets/delete/{id}
pub async fn delete_preset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    state.db.delete_preset(&id)?;
    Ok(Json(DeletedResponse { deleted: true }))
}

fn validate_preset(preset: &NewPreset) -> Result<()> {
    if preset.name.trim().is_empty() {
        return Err(ApiError::BadRequest("preset name is required".to_string()));
    }
    Ok(())
}

// === Auth ===

/// POST /auth/register - Create the local account and log in.
pub async fn register_account(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>> {
    let Json(req) = payload?;
    let username = req.username.trim();
    AuthManager::validate_credentials(username, &req.password)?;

    let hash = state.auth.hash_password(&req.password)?;
    let account = state.db.create_account(username, &hash)?;
    let token = state.auth.create_session(&account.username);

    info!(username = %account.username, "Local account created");
    Ok(Json(LoginResponse::success(account.username, token.as_str())))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>> {
    let Json(req) = payload?;

    let Some(account) = state.db.get_account()? else {
        return Ok(Json(LoginResponse::failure(
            LoginStatus::NotRegistered,
            "no account has been registered",
        )));
    };

    let valid = account.username == req.username.trim()
        && state.auth.verify_password(&req.password, &account.password_hash)?;
    if !valid {
        warn!("Failed login attempt");
        return Ok(Json(LoginResponse::failure(
            LoginStatus::Error,
            "invalid username or password",
        )));
    }

    state.db.record_login(&account.username)?;
    let token = state.auth.create_session(&account.username);
    info!(username = %account.username, "Logged in");
    Ok(Json(LoginResponse::success(account.username, token.as_str())))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Json<LogoutResponse> {
    let logged_out = state.auth.logout(&user.token);
    debug!(username = %user.username, logged_out, "Logout");
    Json(LogoutResponse { logged_out })
}
