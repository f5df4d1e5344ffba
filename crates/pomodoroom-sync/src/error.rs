//! Error types for pomodoroom-sync.
//!
//! The hierarchy separates item-scoped failures (recorded on the run, the
//! run continues) from run-scoped failures (the run is closed as failed).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::EntityKind;

/// Run-level error returned by the orchestrator and surfaced to callers.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Another run holds the lease for this scope.
    #[error("a sync run is already active for owner '{owner_id}' ({entity_kind})")]
    AlreadyRunning {
        owner_id: String,
        entity_kind: EntityKind,
    },

    /// Mapping store, run log or local store unavailable.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Provider failure that prevented the run from proceeding at all.
    ///
    /// Recorded on the failed run; `SyncOrchestrator::run` returns the run
    /// rather than this error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The run exceeded its maximum duration and was abandoned.
    ///
    /// Like `Provider`, only ever recorded on the failed run.
    #[error("sync run exceeded maximum duration of {}s", duration_secs(.0))]
    Timeout(Duration),

    /// No adapter is registered for the scope's entity kind.
    #[error("no adapter registered for {0}")]
    UnsupportedKind(EntityKind),

    /// Run log bookkeeping failed.
    #[error("Run log error: {0}")]
    Logger(#[from] LoggerError),
}

impl SyncError {
    /// Whether the caller should retry later rather than report a failure.
    pub fn is_already_running(&self) -> bool {
        matches!(self, SyncError::AlreadyRunning { .. })
    }
}

/// Persistence errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to open the database file.
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Database is locked or the connection is poisoned.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed.
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

/// Errors from mapping writes.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Another local entity already owns this remote id and was synced more recently.
    #[error("remote id '{remote_id}' is already mapped to local id '{existing_local_id}'")]
    Conflict {
        remote_id: String,
        existing_local_id: String,
        incoming_local_id: String,
    },

    /// The row changed since it was read (compare-and-set failed).
    #[error("mapping for local id '{local_id}' changed concurrently")]
    StaleWrite { local_id: String },
}

/// Provider call failures, classified for retry.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Timeout, connection failure, 5xx or rate-limit. Retryable.
    #[error("transient provider error{}: {message}", status_suffix(.status))]
    Transient {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Any other 4xx, malformed payload or unsupported shape. Not retried.
    #[error("permanent provider error{}: {message}", status_suffix(.status))]
    Permanent { status: Option<u16>, message: String },
}

fn duration_secs(d: &Duration) -> u64 {
    d.as_secs()
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify an HTTP error response.
    ///
    /// Google reports quota exhaustion as 403 with a `rateLimitExceeded` or
    /// `userRateLimitExceeded` reason, so those bodies are transient too.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate(body, 512);
        let rate_limited = status == 429
            || (status == 403
                && (body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")));

        if rate_limited || status == 408 || (500..600).contains(&status) {
            ProviderError::Transient {
                status: Some(status),
                message,
                retry_after,
            }
        } else {
            ProviderError::Permanent {
                status: Some(status),
                message,
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } | ProviderError::Permanent { status, .. } => {
                *status
            }
        }
    }

    /// 404 or 410 from the provider.
    pub fn is_not_found(&self) -> bool {
        matches!(self.status(), Some(404) | Some(410))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Transient { retry_after, .. } => *retry_after,
            ProviderError::Permanent { .. } => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            return ProviderError::permanent(err.to_string());
        }
        if let Some(status) = err.status() {
            return ProviderError::from_status(status.as_u16(), &err.to_string(), None);
        }
        // timeouts, connect failures, broken bodies
        ProviderError::transient(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::permanent(format!("malformed payload: {err}"))
    }
}

/// Run log errors.
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("sync run '{0}' is already finished")]
    AlreadyFinished(String),

    #[error("sync run '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    /// Home/config directory could not be prepared
    #[error("Failed to prepare data directory: {0}")]
    DataDir(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg)
                if code.code == rusqlite::ErrorCode::DatabaseLocked
                    || code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Result type alias for SyncError
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
