//! Keyward Storage - SQLite record store and usage ledger.
//!
//! Every collection is a table of JSON documents behind a typed repository:
//!
//! - Applications and their consent state
//! - Provider keys (the real upstream credentials)
//! - Presets (named groups of keys, including the undeletable `default`)
//! - The append-only usage ledger
//! - The local dashboard account
//!
//! # Example
//!
//! ```no_run
//! use keyward_storage::{Database, models::RegisterApp};
//!
//! let db = Database::in_memory().unwrap();
//!
//! let registration = db.register_app(&RegisterApp {
//!     id: None,
//!     name: "demo".to_string(),
//!     description: "Example app".to_string(),
//! }).unwrap();
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, DB_FILE, DEFAULT_PAGE_SIZE, DEFAULT_STATS_DAYS, MAX_PAGE_SIZE};
pub use error::{Result, StorageError};
pub use models::*;
