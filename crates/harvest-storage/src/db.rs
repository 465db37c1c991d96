//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use harvest_core::config::{expand_home, DatabaseConfig};
use harvest_core::error::HarvestError;

use crate::migrations;

/// Thread-safe SQLite database handle.
///
/// One handle is opened per pipeline run and shared between workers through
/// an `Arc`. The connection closes when the last reference is dropped.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database described by the configuration.
    pub fn open(config: &DatabaseConfig) -> Result<Self, HarvestError> {
        let path = expand_home(&config.path);
        Self::new(&path, config.busy_timeout_ms)
    }

    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, a busy timeout,
    /// and runs all pending migrations.
    pub fn new(path: &Path, busy_timeout_ms: u64) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| HarvestError::Storage(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
            .map_err(|e| HarvestError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -65536;",
        )
        .map_err(|e| HarvestError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| HarvestError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| HarvestError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure, so each closure is
    /// one atomic unit with respect to other workers.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, HarvestError>
    where
        F: FnOnce(&Connection) -> Result<T, HarvestError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| HarvestError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Map a rusqlite error into the storage error variant.
pub(crate) fn storage_err(e: rusqlite::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                .map_err(storage_err)?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harvest.db");
        let db = Database::new(&path, 1_000).unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
                .map_err(storage_err)?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("h.db").to_string_lossy().to_string(),
            busy_timeout_ms: 500,
        };
        let db = Database::open(&config).unwrap();
        db.with_conn(|conn| {
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(storage_err)?;
            assert_eq!(mode, "wal");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.db");
        {
            let db = Database::new(&path, 1_000).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO messages (identifier, channel, payload) VALUES ('1', 'c', '{}')",
                    [],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .unwrap();
        }
        let db = Database::new(&path, 1_000).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                    .map_err(storage_err)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
