//! High-level database interface.
//!
//! Single-document reads go through pooled readers. Anything that must keep
//! several documents consistent runs inside one write transaction.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use keyward_core::pricing;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::models::{
    Account, Application, NewPreset, NewProviderKey, NewUsage, Preset, ProviderKey, RegisterApp,
    Registration, UsagePage, UsageRecord, UsageStats, DEFAULT_PRESET_ID,
};
use crate::pool::ConnectionPool;
use crate::repository::{
    aggregate_usage, generate_usage_id, AccountsRepo, AppsRepo, KeysRepo, PresetsRepo, UsageRepo,
};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "keyward.db";

/// Window used when the requested one is missing or not positive.
pub const DEFAULT_STATS_DAYS: i64 = 30;

/// Page size used when the requested one is out of range.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 200;

/// High-level database interface for Keyward.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open the database in the default data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Open (or create) the database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let db = Self {
            pool: ConnectionPool::new(&path)?,
        };
        db.ensure_default_preset()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Self {
            pool: ConnectionPool::in_memory()?,
        };
        db.ensure_default_preset()?;
        Ok(db)
    }

    /// `<data dir>/keyward.db`.
    pub fn default_db_path() -> Result<PathBuf> {
        keyward_core::discovery::default_data_dir()
            .map(|dir| dir.join(DB_FILE))
            .map_err(|e| StorageError::Config(e.to_string()))
    }

    fn ensure_default_preset(&self) -> Result<()> {
        self.pool.transaction(|tx| {
            if PresetsRepo::find(tx, DEFAULT_PRESET_ID)?.is_none() {
                let now = Utc::now();
                PresetsRepo::put(
                    tx,
                    &Preset {
                        id: DEFAULT_PRESET_ID.to_string(),
                        name: DEFAULT_PRESET_ID.to_string(),
                        key_ids: Vec::new(),
                        created_at: now,
                        updated_at: now,
                    },
                )?;
                info!("Created default preset");
            }
            Ok(())
        })
    }

    // === Applications ===

    /// Resolve a register call to an application record.
    ///
    /// A granted id is returned as is. Otherwise the application (matched by
    /// id, else by name, else new) is stored ungranted, keeping any earlier
    /// key binding and creation time.
    pub fn register_app(&self, req: &RegisterApp) -> Result<Registration> {
        self.pool.transaction(|tx| {
            let now = Utc::now();
            let requested_id = req.id.as_deref().filter(|id| !id.is_empty());

            let existing = match requested_id {
                Some(id) => AppsRepo::find(tx, id)?,
                None => AppsRepo::list(tx)?
                    .into_iter()
                    .find(|app| app.name == req.name),
            };

            if let Some(mut app) = existing.clone().filter(|app| app.granted && requested_id.is_some()) {
                app.last_active_at = now;
                AppsRepo::put(tx, &app)?;
                return Ok(Registration::Granted(app));
            }

            let app = Application {
                id: existing
                    .as_ref()
                    .map(|app| app.id.clone())
                    .or_else(|| requested_id.map(str::to_string))
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: req.name.clone(),
                description: req.description.clone(),
                bound_key_id: existing.as_ref().and_then(|app| app.bound_key_id.clone()),
                granted: false,
                created_at: existing.as_ref().map(|app| app.created_at).unwrap_or(now),
                last_active_at: now,
            };
            AppsRepo::put(tx, &app)?;
            debug!(app_id = %app.id, name = %app.name, "Application pending consent");

            Ok(Registration::Pending(app))
        })
    }

    pub fn get_app(&self, id: &str) -> Result<Application> {
        let conn = self.pool.get()?;
        AppsRepo::get(&conn, id)
    }

    pub fn find_app(&self, id: &str) -> Result<Option<Application>> {
        let conn = self.pool.get()?;
        AppsRepo::find(&conn, id)
    }

    pub fn list_apps(&self) -> Result<Vec<Application>> {
        let conn = self.pool.get()?;
        AppsRepo::list(&conn)
    }

    /// Set `granted` and, when given, the bound key. An unknown key is
    /// `NotFound` and leaves the application unchanged.
    pub fn toggle_app(&self, id: &str, granted: bool, key_id: Option<&str>) -> Result<Application> {
        self.pool.transaction(|tx| {
            let mut app = AppsRepo::get(tx, id)?;
            app.granted = granted;
            if let Some(key_id) = key_id.filter(|k| !k.is_empty()) {
                KeysRepo::get(tx, key_id)?;
                app.bound_key_id = Some(key_id.to_string());
            }
            AppsRepo::put(tx, &app)?;
            Ok(app)
        })
    }

    /// Apply a consent decision.
    ///
    /// An approval binds `key_id`, else keeps the existing binding, else
    /// binds the first key of the default preset.
    pub fn decide_app(&self, id: &str, approved: bool, key_id: Option<&str>) -> Result<Application> {
        self.pool.transaction(|tx| {
            let mut app = AppsRepo::get(tx, id)?;
            app.granted = approved;

            if approved {
                let chosen = match key_id.filter(|k| !k.is_empty()) {
                    Some(key_id) => Some(KeysRepo::get(tx, key_id)?.id),
                    None => match app.bound_key_id.clone() {
                        Some(bound) => Some(bound),
                        None => PresetsRepo::find(tx, DEFAULT_PRESET_ID)?
                            .and_then(|preset| preset.key_ids.into_iter().next()),
                    },
                };
                app.bound_key_id = chosen;
            }

            AppsRepo::put(tx, &app)?;
            Ok(app)
        })
    }

    /// Refresh `lastActiveAt`. Missing applications are ignored.
    pub fn touch_app(&self, id: &str) -> Result<()> {
        self.pool.transaction(|tx| {
            if let Some(mut app) = AppsRepo::find(tx, id)? {
                app.last_active_at = Utc::now();
                AppsRepo::put(tx, &app)?;
            }
            Ok(())
        })
    }

    pub fn delete_app(&self, id: &str) -> Result<()> {
        let conn = self.pool.writer()?;
        AppsRepo::delete(&conn, id)
    }

    /// Delete every application. Returns the removed ids.
    pub fn clear_apps(&self) -> Result<Vec<String>> {
        self.pool.transaction(|tx| {
            let ids = AppsRepo::list(tx)?.into_iter().map(|app| app.id).collect();
            AppsRepo::clear(tx)?;
            Ok(ids)
        })
    }

    // === Provider keys ===

    pub fn list_keys(&self) -> Result<Vec<ProviderKey>> {
        let conn = self.pool.get()?;
        KeysRepo::list(&conn)
    }

    pub fn get_key(&self, id: &str) -> Result<ProviderKey> {
        let conn = self.pool.get()?;
        KeysRepo::get(&conn, id)
    }

    pub fn find_key(&self, id: &str) -> Result<Option<ProviderKey>> {
        let conn = self.pool.get()?;
        KeysRepo::find(&conn, id)
    }

    pub fn add_key(&self, new: NewProviderKey) -> Result<ProviderKey> {
        let key = ProviderKey {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            kind: new.kind,
            protocol: new.protocol,
            base_url: new.base_url,
            token: new.token,
        };

        let conn = self.pool.writer()?;
        KeysRepo::put(&conn, &key)?;
        info!(key_id = %key.id, name = %key.name, "Added provider key");
        Ok(key)
    }

    pub fn update_key(&self, id: &str, new: NewProviderKey) -> Result<ProviderKey> {
        self.pool.transaction(|tx| {
            let existing = KeysRepo::get(tx, id)?;
            let key = ProviderKey {
                id: existing.id,
                name: new.name,
                kind: new.kind,
                protocol: new.protocol,
                base_url: new.base_url,
                token: new.token,
            };
            KeysRepo::put(tx, &key)?;
            Ok(key)
        })
    }

    /// Delete a key, removing it from every preset and unbinding it from
    /// every application in the same transaction.
    pub fn delete_key(&self, id: &str) -> Result<()> {
        self.pool.transaction(|tx| {
            KeysRepo::get(tx, id)?;
            let now = Utc::now();

            for mut preset in PresetsRepo::list(tx)? {
                if preset.key_ids.iter().any(|k| k == id) {
                    preset.key_ids.retain(|k| k != id);
                    preset.updated_at = now;
                    PresetsRepo::put(tx, &preset)?;
                }
            }

            for mut app in AppsRepo::list(tx)? {
                if app.bound_key_id.as_deref() == Some(id) {
                    app.bound_key_id = None;
                    AppsRepo::put(tx, &app)?;
                }
            }

            KeysRepo::delete(tx, id)?;
            info!(key_id = id, "Deleted provider key");
            Ok(())
        })
    }

    // === Presets ===

    /// All presets, most recently updated first.
    pub fn list_presets(&self) -> Result<Vec<Preset>> {
        let conn = self.pool.get()?;
        let mut presets = PresetsRepo::list(&conn)?;
        presets.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(presets)
    }

    pub fn get_preset(&self, id: &str) -> Result<Preset> {
        let conn = self.pool.get()?;
        PresetsRepo::get(&conn, id)
    }

    pub fn add_preset(&self, new: NewPreset) -> Result<Preset> {
        self.pool.transaction(|tx| {
            ensure_unique_preset_name(tx, &new.name, None)?;
            ensure_keys_exist(tx, &new.key_ids)?;

            let now = Utc::now();
            let preset = Preset {
                id: Uuid::new_v4().to_string(),
                name: new.name,
                key_ids: new.key_ids,
                created_at: now,
                updated_at: now,
            };
            PresetsRepo::put(tx, &preset)?;
            Ok(preset)
        })
    }

    pub fn update_preset(&self, id: &str, new: NewPreset) -> Result<Preset> {
        self.pool.transaction(|tx| {
            let mut preset = PresetsRepo::get(tx, id)?;

            if preset.is_default() && new.name != preset.name {
                return Err(StorageError::Conflict(
                    "the default preset cannot be renamed".to_string(),
                ));
            }
            if new.name != preset.name {
                ensure_unique_preset_name(tx, &new.name, Some(id))?;
            }
            ensure_keys_exist(tx, &new.key_ids)?;

            preset.name = new.name;
            preset.key_ids = new.key_ids;
            preset.updated_at = Utc::now();
            PresetsRepo::put(tx, &preset)?;
            Ok(preset)
        })
    }

    pub fn delete_preset(&self, id: &str) -> Result<()> {
        self.pool.transaction(|tx| {
            let preset = PresetsRepo::get(tx, id)?;
            if preset.is_default() {
                return Err(StorageError::Conflict(
                    "the default preset cannot be deleted".to_string(),
                ));
            }
            PresetsRepo::delete(tx, id)
        })
    }

    // === Usage ===

    /// Append a usage record, computing totals, cost, id, and timestamp.
    pub fn record_usage(&self, usage: NewUsage) -> Result<UsageRecord> {
        let now = Utc::now();
        let record = UsageRecord {
            id: generate_usage_id(now),
            cost: pricing::calculate_cost(&usage.model, usage.prompt_tokens, usage.output_tokens),
            total_tokens: usage.prompt_tokens + usage.output_tokens,
            app_id: usage.app_id,
            app_name: usage.app_name,
            key_name: usage.key_name,
            model: usage.model,
            prompt_tokens: usage.prompt_tokens,
            output_tokens: usage.output_tokens,
            endpoint: usage.endpoint,
            status: usage.status,
            timestamp: now,
        };

        let conn = self.pool.writer()?;
        UsageRepo::put(&conn, &record)?;
        debug!(
            app_id = %record.app_id,
            model = %record.model,
            total_tokens = record.total_tokens,
            status = record.status.as_str(),
            "Recorded usage"
        );
        Ok(record)
    }

    /// Statistics over the last `days` days (`<= 0` means 30).
    pub fn usage_stats(&self, days: i64) -> Result<UsageStats> {
        let days = if days <= 0 { DEFAULT_STATS_DAYS } else { days };
        let since = Utc::now() - Duration::days(days);

        let conn = self.pool.get()?;
        Ok(aggregate_usage(UsageRepo::since(&conn, since)?))
    }

    /// One page of the ledger, newest first.
    ///
    /// `page < 1` reads page 1; a page size outside `1..=200` reads 50.
    pub fn usage_list(&self, page: i64, page_size: i64) -> Result<UsagePage> {
        let page = u32::try_from(page.max(1)).unwrap_or(u32::MAX);
        let page_size = u32::try_from(page_size)
            .ok()
            .filter(|size| (1..=MAX_PAGE_SIZE).contains(size))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(page_size);

        let conn = self.pool.get()?;
        Ok(UsagePage {
            records: UsageRepo::page(&conn, page_size, offset)?,
            total: UsageRepo::count(&conn)?,
            page,
            page_size,
        })
    }

    pub fn clear_usage(&self) -> Result<usize> {
        let conn = self.pool.writer()?;
        let removed = UsageRepo::clear(&conn)?;
        info!(removed, "Cleared usage ledger");
        Ok(removed)
    }

    // === Account ===

    /// The local account, if one was created.
    pub fn get_account(&self) -> Result<Option<Account>> {
        let conn = self.pool.get()?;
        Ok(AccountsRepo::list(&conn)?.into_iter().next())
    }

    /// Create the local account. Fails with `Conflict` if one exists.
    pub fn create_account(&self, username: &str, password_hash: &str) -> Result<Account> {
        self.pool.transaction(|tx| {
            if AccountsRepo::count(tx)? > 0 {
                return Err(StorageError::Conflict(
                    "an account is already registered".to_string(),
                ));
            }

            let account = Account {
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                created_at: Utc::now(),
                last_login: None,
            };
            AccountsRepo::put(tx, &account)?;
            Ok(account)
        })
    }

    pub fn record_login(&self, username: &str) -> Result<()> {
        self.pool.transaction(|tx| {
            let mut account = AccountsRepo::get(tx, username)?;
            account.last_login = Some(Utc::now());
            AccountsRepo::put(tx, &account)
        })
    }
}

fn ensure_unique_preset_name(
    conn: &rusqlite::Connection,
    name: &str,
    exclude_id: Option<&str>,
) -> Result<()> {
    let taken = PresetsRepo::list(conn)?
        .iter()
        .any(|p| p.name == name && Some(p.id.as_str()) != exclude_id);

    if taken {
        return Err(StorageError::Conflict(format!(
            "preset name '{}' already exists",
            name
        )));
    }
    Ok(())
}

/// Every referenced key must exist; bindings never dangle.
fn ensure_keys_exist(conn: &rusqlite::Connection, key_ids: &[String]) -> Result<()> {
    for key_id in key_ids {
        KeysRepo::get(conn, key_id)?;
    }
    Ok(())
}
