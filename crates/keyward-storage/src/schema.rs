//! Database schema and migrations.
//!
//! Every collection is a `(id, value)` table holding one JSON document per
//! row. Usage ids sort chronologically, so the ledger needs no extra index.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Collections created by the first migration.
pub const COLLECTIONS: &[&str] = &["apps", "provider_keys", "presets", "usage_records"];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        if current_version < 2 {
            migrate_v2(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn create_collection(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );"
    ))?;
    Ok(())
}

/// Migration v1: broker collections.
fn migrate_v1(conn: &Connection) -> Result<()> {
    for table in COLLECTIONS {
        create_collection(conn, table)?;
    }
    Ok(())
}

/// Migration v2: local dashboard account.
fn migrate_v2(conn: &Connection) -> Result<()> {
    create_collection(conn, "accounts")
}
