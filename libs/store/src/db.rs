//! Single embedded SQLite database shared by every durable store.
//!
//! One connection behind a mutex: every store operation is a short
//! single-statement (or single-transaction) critical section, and SQLite's
//! own locking plus the busy timeout covers the WAL readers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file, switch it to WAL
    /// journaling, and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        migrations::apply(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read or single-statement write against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard)?)
    }

    /// Run a multi-statement operation inside one transaction.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = guard.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
    let db = Database::open(&dir.path().join("porter.db"))
        .unwrap_or_else(|error| panic!("open failed: {error}"));
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_migrations_and_uses_wal() {
        let (_dir, db) = test_database();

        let mode: String = db
            .with_conn(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap_or_else(|error| panic!("pragma failed: {error}"));
        assert_eq!(mode, "wal");

        let versions: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            })
            .unwrap_or_else(|error| panic!("count failed: {error}"));
        assert!(versions >= 1);
    }

    #[test]
    fn reopen_does_not_reapply_migrations() {
        let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("tempdir failed: {error}"));
        let path = dir.path().join("porter.db");

        let first = Database::open(&path).unwrap_or_else(|error| panic!("open failed: {error}"));
        let count_first: i64 = first
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            })
            .unwrap_or_else(|error| panic!("count failed: {error}"));
        drop(first);

        let second = Database::open(&path).unwrap_or_else(|error| panic!("reopen failed: {error}"));
        let count_second: i64 = second
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            })
            .unwrap_or_else(|error| panic!("count failed: {error}"));

        assert_eq!(count_first, count_second);
    }
}
