//! SQLite persistence for sync state.
//!
//! One database file (`sync.db`) holds mappings, run records, leases,
//! webhook subscriptions and the local entity table used by the CLI.

pub mod lease;
pub mod local_store;
pub mod mapping_store;
pub mod migrations;
pub mod subscriptions;

#[cfg(test)]
mod mapping_store_tests;

pub use lease::{LeaseStore, SqliteLeaseStore};
pub use local_store::{LocalStore, SqliteLocalStore};
pub use mapping_store::{FlaggedMapping, MappingStore, SqliteMappingStore};
pub use subscriptions::{SqliteSubscriptionStore, SubscriptionStore, WebhookSubscription};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::StorageError;

/// Returns `~/.config/pomodoroom[-dev]/` based on POMODOROOM_ENV.
///
/// Set POMODOROOM_ENV=dev to use development data directory.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("POMODOROOM_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("pomodoroom-dev")
    } else {
        base_dir.join("pomodoroom")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Shared handle to the sync database. Cloning is cheap.
#[derive(Clone)]
pub struct SyncDb {
    conn: Arc<Mutex<Connection>>,
}

impl SyncDb {
    /// Open `sync.db` in the data directory.
    pub fn open() -> Result<Self, StorageError> {
        let dir = data_dir().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Self::open_at(&dir.join("sync.db"))
    }

    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open_at(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|source| StorageError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        migrations::migrate(&conn).map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection. A poisoned lock is reported as unavailable storage.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
    }

    pub fn mappings(&self) -> SqliteMappingStore {
        SqliteMappingStore::new(self.clone())
    }

    pub fn leases(&self) -> SqliteLeaseStore {
        SqliteLeaseStore::new(self.clone())
    }

    pub fn local_entities(&self) -> SqliteLocalStore {
        SqliteLocalStore::new(self.clone())
    }

    pub fn subscriptions(&self) -> SqliteSubscriptionStore {
        SqliteSubscriptionStore::new(self.clone())
    }
}

/// Timestamps are stored as RFC 3339 UTC with milliseconds so they sort as text.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            message: format!("bad timestamp '{raw}': {e}"),
        })
}
