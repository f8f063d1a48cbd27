//! Database connection pool.
//!
//! One writer connection handles every mutation. File databases also get a
//! few read-only connections so reads proceed while a write transaction is
//! open (WAL mode). In-memory databases cannot share state across
//! connections, so their reads go through the writer.

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

/// Read-only connections opened for a file database.
const READER_COUNT: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe single-writer, multi-reader connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl ConnectionPool {
    /// Create a new connection pool with a file-based database.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = Connection::open(path)?;
        Self::setup_writer(&writer)?;
        run_migrations(&writer)?;

        let readers = (0..READER_COUNT)
            .map(|_| Self::open_reader(path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create a new connection pool with an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup_writer(&conn)?;
        run_migrations(&conn)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get a connection for reading.
    pub fn get(&self) -> Result<PooledConnection<'_>> {
        if self.readers.is_empty() {
            return self.writer();
        }

        // Prefer an idle reader; otherwise queue on the next one in turn.
        for reader in self.readers.iter() {
            if let Ok(guard) = reader.try_lock() {
                return Ok(PooledConnection { guard });
            }
        }

        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let guard = self.readers[index]
            .lock()
            .map_err(|_| StorageError::Config("Reader connection poisoned".to_string()))?;
        Ok(PooledConnection { guard })
    }

    /// Get the writer connection.
    pub fn writer(&self) -> Result<PooledConnection<'_>> {
        let guard = self
            .writer
            .lock()
            .map_err(|_| StorageError::Config("Connection pool poisoned".to_string()))?;

        Ok(PooledConnection { guard })
    }

    /// Run `f` inside one immediate write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| StorageError::Config("Connection pool poisoned".to_string()))?;

        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Setup writer pragmas for durability and concurrent readers.
    fn setup_writer(conn: &Connection) -> Result<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -2000;",
        )?;
        Ok(())
    }

    fn open_reader(path: &Path) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

/// A connection borrowed from the pool.
pub struct PooledConnection<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl<'a> std::ops::Deref for PooledConnection<'a> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_pool() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_pool_readers_see_committed_writes() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(dir.path().join("test.db")).unwrap();

        pool.transaction(|tx| {
            tx.execute(
                "INSERT INTO apps (id, value) VALUES ('a', '{}')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_readers_are_read_only() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(dir.path().join("test.db")).unwrap();

        let conn = pool.get().unwrap();
        assert!(conn
            .execute("INSERT INTO apps (id, value) VALUES ('a', '{}')", [])
            .is_err());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let pool = ConnectionPool::in_memory().unwrap();

        let result: Result<()> = pool.transaction(|tx| {
            tx.execute("INSERT INTO apps (id, value) VALUES ('a', '{}')", [])?;
            Err(StorageError::Conflict("abort".to_string()))
        });
        assert!(result.is_err());

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_read_while_writing() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new(dir.path().join("test.db")).unwrap();

        let _writer = pool.writer().unwrap();
        // A reader is still available while the writer is held.
        let reader = pool.get().unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM presets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
