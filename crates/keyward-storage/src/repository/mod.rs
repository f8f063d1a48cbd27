//! Typed repositories over the JSON document tables.
//!
//! [`Collection`] is generic over a [`Record`]; each model names its table
//! and its key. Every function takes a plain `&Connection`, so the same code
//! runs against a pooled reader or inside a write transaction.

pub mod usage;

use std::marker::PhantomData;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StorageError};
use crate::models::{Account, Application, Preset, ProviderKey, UsageRecord};

pub use usage::{aggregate_usage, generate_usage_id};

/// A document stored in one collection table.
pub trait Record: Serialize + DeserializeOwned {
    /// Table holding this collection.
    const TABLE: &'static str;

    /// Human-readable name used in `NotFound` errors.
    const KIND: &'static str;

    /// Primary key of this document.
    fn key(&self) -> &str;
}

impl Record for Application {
    const TABLE: &'static str = "apps";
    const KIND: &'static str = "Application";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for ProviderKey {
    const TABLE: &'static str = "provider_keys";
    const KIND: &'static str = "Key";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for Preset {
    const TABLE: &'static str = "presets";
    const KIND: &'static str = "Preset";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for UsageRecord {
    const TABLE: &'static str = "usage_records";
    const KIND: &'static str = "Usage record";

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for Account {
    const TABLE: &'static str = "accounts";
    const KIND: &'static str = "Account";

    fn key(&self) -> &str {
        &self.username
    }
}

/// Repository for one collection.
pub struct Collection<T>(PhantomData<T>);

pub type AppsRepo = Collection<Application>;
pub type KeysRepo = Collection<ProviderKey>;
pub type PresetsRepo = Collection<Preset>;
pub type UsageRepo = Collection<UsageRecord>;
pub type AccountsRepo = Collection<Account>;

impl<T: Record> Collection<T> {
    /// Get a document by id. Missing ids are `NotFound`.
    pub fn get(conn: &Connection, id: &str) -> Result<T> {
        Self::find(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("{} {}", T::KIND, id)))
    }

    /// Get a document by id, if present.
    pub fn find(conn: &Connection, id: &str) -> Result<Option<T>> {
        let sql = format!("SELECT value FROM {} WHERE id = ?1", T::TABLE);
        let value: Option<String> = conn
            .query_row(&sql, [id], |row| row.get(0))
            .optional()?;

        value
            .map(|v| serde_json::from_str(&v).map_err(StorageError::from))
            .transpose()
    }

    /// All documents ordered by id.
    pub fn list(conn: &Connection) -> Result<Vec<T>> {
        let sql = format!("SELECT value FROM {} ORDER BY id", T::TABLE);
        Self::query(conn, &sql, [])
    }

    /// Insert or replace a document.
    pub fn put(conn: &Connection, record: &T) -> Result<()> {
        let value = serde_json::to_string(record)?;
        let sql = format!(
            "INSERT INTO {} (id, value) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET value = ?2",
            T::TABLE
        );
        conn.execute(&sql, params![record.key(), value])?;
        Ok(())
    }

    /// Delete a document. Missing ids are `NotFound`.
    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE);
        match conn.execute(&sql, [id])? {
            0 => Err(StorageError::NotFound(format!("{} {}", T::KIND, id))),
            _ => Ok(()),
        }
    }

    /// Delete every document. Returns how many were removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let sql = format!("DELETE FROM {}", T::TABLE);
        Ok(conn.execute(&sql, [])?)
    }

    pub fn count(conn: &Connection) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Run a `SELECT value ...` query and decode every row.
    pub(crate) fn query(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let values = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        values
            .iter()
            .map(|v| serde_json::from_str(v).map_err(StorageError::from))
            .collect()
    }
}
