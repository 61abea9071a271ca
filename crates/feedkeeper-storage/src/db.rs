//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tracing::info;

use feedkeeper_core::error::FeedkeeperError;

use crate::migrations;

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe SQLite database wrapper.
///
/// The connection is wrapped in a Mutex since rusqlite Connection is not
/// Sync. Every statement issued through [`Database::with_conn`] is therefore
/// serialized, which is what makes the conditional insert in the record
/// store atomic with respect to concurrent callers in this process.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL and a busy timeout, then runs
    /// all pending migrations.
    pub fn new(path: &Path) -> Result<Self, FeedkeeperError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| sqlite_error("Failed to open database", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| sqlite_error("Failed to set pragmas", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| sqlite_error("Failed to set busy timeout", e))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, FeedkeeperError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| sqlite_error("Failed to open in-memory db", e))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| sqlite_error("Failed to set pragmas", e))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure. A poisoned mutex
    /// is reported as [`FeedkeeperError::StorageUnavailable`].
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, FeedkeeperError>
    where
        F: FnOnce(&Connection) -> Result<T, FeedkeeperError>,
    {
        let conn = self.conn.lock().map_err(|e| {
            FeedkeeperError::StorageUnavailable(format!("Database lock poisoned: {}", e))
        })?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Map a rusqlite error to the storage error taxonomy.
///
/// Failures to reach the database (busy, locked, cannot open, I/O, disk
/// full) are retryable `StorageUnavailable`; everything else is `Storage`.
pub(crate) fn sqlite_error(context: &str, err: rusqlite::Error) -> FeedkeeperError {
    let unavailable = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
        )
    );
    if unavailable {
        FeedkeeperError::StorageUnavailable(format!("{}: {}", context, err))
    } else {
        FeedkeeperError::Storage(format!("{}: {}", context, err))
    }
}
