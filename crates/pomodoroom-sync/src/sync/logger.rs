//! Run log: one `sync_runs` row per attempt plus its ordered item errors.
//!
//! A run is opened as `started`, mutated only while still `started`, and
//! finalized exactly once. Rows are never rewritten after that.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LoggerError, StorageError};
use crate::storage::{decode_ts, encode_ts, SyncDb};
use crate::types::{Direction, EntityKind, RunStatus, Trigger};

/// Reference used for errors that are not tied to one entity.
pub const RUN_REF: &str = "run";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    #[serde(rename = "ref")]
    pub entity_ref: String,
    pub message: String,
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: String,
    pub owner_id: String,
    pub provider: String,
    pub trigger: Trigger,
    pub direction: Direction,
    pub entity_kind: EntityKind,
    pub status: RunStatus,
    pub items_created: u32,
    pub items_updated: u32,
    pub items_deleted: u32,
    pub errors: Vec<ItemError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub fn summary(&self) -> SyncRunSummary {
        SyncRunSummary {
            run_id: self.run_id.clone(),
            success: self.status == RunStatus::Completed && self.errors.is_empty(),
            status: self.status,
            items_created: self.items_created,
            items_updated: self.items_updated,
            items_deleted: self.items_deleted,
            errors: self.errors.clone(),
        }
    }
}

/// Response shape of the trigger API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub run_id: String,
    pub success: bool,
    pub status: RunStatus,
    pub items_created: u32,
    pub items_updated: u32,
    pub items_deleted: u32,
    pub errors: Vec<ItemError>,
}

#[derive(Clone)]
pub struct SyncLogger {
    db: SyncDb,
}

const RUN_COLUMNS: &str = "run_id, owner_id, provider, trigger, direction, entity_kind, status,
                           items_created, items_updated, items_deleted, started_at, completed_at";

struct RawRun {
    run_id: String,
    owner_id: String,
    provider: String,
    trigger: String,
    direction: String,
    entity_kind: String,
    status: String,
    items_created: u32,
    items_updated: u32,
    items_deleted: u32,
    started_at: String,
    completed_at: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            owner_id: row.get(1)?,
            provider: row.get(2)?,
            trigger: row.get(3)?,
            direction: row.get(4)?,
            entity_kind: row.get(5)?,
            status: row.get(6)?,
            items_created: row.get(7)?,
            items_updated: row.get(8)?,
            items_deleted: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn decode(self, errors: Vec<ItemError>) -> Result<SyncRun, StorageError> {
        let corrupt = |message: String| StorageError::Corrupt {
            table: "sync_runs",
            message,
        };
        Ok(SyncRun {
            trigger: self.trigger.parse().map_err(corrupt)?,
            direction: self.direction.parse().map_err(corrupt)?,
            entity_kind: self.entity_kind.parse().map_err(corrupt)?,
            status: self.status.parse().map_err(corrupt)?,
            started_at: decode_ts("sync_runs", &self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|raw| decode_ts("sync_runs", raw))
                .transpose()?,
            run_id: self.run_id,
            owner_id: self.owner_id,
            provider: self.provider,
            items_created: self.items_created,
            items_updated: self.items_updated,
            items_deleted: self.items_deleted,
            errors,
        })
    }
}

fn load_errors(conn: &rusqlite::Connection, run_id: &str) -> Result<Vec<ItemError>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT entity_ref, message FROM sync_run_errors WHERE run_id = ?1 ORDER BY seq",
    )?;
    let errors = stmt
        .query_map([run_id], |row| {
            Ok(ItemError {
                entity_ref: row.get(0)?,
                message: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(errors)
}

fn load_run(conn: &rusqlite::Connection, run_id: &str) -> Result<Option<SyncRun>, StorageError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE run_id = ?1"),
            [run_id],
            RawRun::from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => {
            let errors = load_errors(conn, run_id)?;
            Ok(Some(raw.decode(errors)?))
        }
        None => Ok(None),
    }
}

fn run_status(conn: &rusqlite::Connection, run_id: &str) -> Result<Option<String>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT status FROM sync_runs WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Explain why a guarded update touched no rows.
fn not_open(conn: &rusqlite::Connection, run_id: &str) -> LoggerError {
    match run_status(conn, run_id) {
        Ok(Some(_)) => LoggerError::AlreadyFinished(run_id.to_string()),
        Ok(None) => LoggerError::NotFound(run_id.to_string()),
        Err(e) => LoggerError::Storage(e),
    }
}

impl SyncLogger {
    pub fn new(db: SyncDb) -> Self {
        Self { db }
    }

    /// Open a run in `started` state.
    pub fn start(
        &self,
        owner_id: &str,
        provider: &str,
        trigger: Trigger,
        direction: Direction,
        entity_kind: EntityKind,
    ) -> Result<SyncRun, LoggerError> {
        let run = SyncRun {
            run_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            provider: provider.to_string(),
            trigger,
            direction,
            entity_kind,
            status: RunStatus::Started,
            items_created: 0,
            items_updated: 0,
            items_deleted: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (run_id, owner_id, provider, trigger, direction, entity_kind,
                                    status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id,
                run.owner_id,
                run.provider,
                trigger.as_str(),
                direction.as_str(),
                entity_kind.as_str(),
                RunStatus::Started.as_str(),
                encode_ts(run.started_at),
            ],
        )
        .map_err(StorageError::from)?;

        info!(
            run_id = %run.run_id,
            owner_id,
            entity_kind = %entity_kind,
            direction = %direction,
            trigger = trigger.as_str(),
            "sync run started"
        );
        Ok(run)
    }

    pub fn record_item(&self, run_id: &str, outcome: ItemOutcome) -> Result<(), LoggerError> {
        let column = match outcome {
            ItemOutcome::Created => "items_created",
            ItemOutcome::Updated => "items_updated",
            ItemOutcome::Deleted => "items_deleted",
        };
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE sync_runs SET {column} = {column} + 1
                     WHERE run_id = ?1 AND status = 'started'"
                ),
                [run_id],
            )
            .map_err(StorageError::from)?;
        if changed == 0 {
            return Err(not_open(&conn, run_id));
        }
        Ok(())
    }

    /// Append an item error. Order of insertion is preserved.
    pub fn record_error(
        &self,
        run_id: &str,
        entity_ref: &str,
        message: &str,
    ) -> Result<(), LoggerError> {
        let conn = self.db.lock()?;
        let inserted = conn
            .execute(
                "INSERT INTO sync_run_errors (run_id, seq, entity_ref, message, recorded_at)
                 SELECT ?1,
                        (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_run_errors WHERE run_id = ?1),
                        ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM sync_runs WHERE run_id = ?1 AND status = 'started')",
                params![run_id, entity_ref, message, encode_ts(Utc::now())],
            )
            .map_err(StorageError::from)?;
        if inserted == 0 {
            return Err(not_open(&conn, run_id));
        }
        warn!(run_id, entity_ref, error = message, "sync item failed");
        Ok(())
    }

    /// Finalize a run. A second call fails with `AlreadyFinished`.
    pub fn finish(&self, run_id: &str, status: RunStatus) -> Result<SyncRun, LoggerError> {
        let status = if status.is_terminal() {
            status
        } else {
            RunStatus::Failed
        };
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE sync_runs SET status = ?1, completed_at = ?2
                 WHERE run_id = ?3 AND status = 'started'",
                params![status.as_str(), encode_ts(Utc::now()), run_id],
            )
            .map_err(StorageError::from)?;
        if changed == 0 {
            return Err(not_open(&conn, run_id));
        }

        let run = load_run(&conn, run_id)?.ok_or_else(|| LoggerError::NotFound(run_id.to_string()))?;
        info!(
            run_id,
            owner_id = %run.owner_id,
            status = status.as_str(),
            created = run.items_created,
            updated = run.items_updated,
            deleted = run.items_deleted,
            errors = run.errors.len(),
            "sync run finished"
        );
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<SyncRun>, LoggerError> {
        let conn = self.db.lock()?;
        Ok(load_run(&conn, run_id)?)
    }

    /// Most recent runs first.
    pub fn history(&self, owner_id: &str, limit: usize) -> Result<Vec<SyncRun>, LoggerError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM sync_runs
                 WHERE owner_id = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?2"
            ))
            .map_err(StorageError::from)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raws = stmt
            .query_map(params![owner_id, limit], RawRun::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(StorageError::from)?;

        let mut runs = Vec::with_capacity(raws.len());
        for raw in raws {
            let errors = load_errors(&conn, &raw.run_id)?;
            runs.push(raw.decode(errors)?);
        }
        Ok(runs)
    }

    /// Fail every `started` run older than `max_duration` as of `now`.
    /// Returns the ids of the runs that were closed.
    pub fn abandon_expired(
        &self,
        max_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, LoggerError> {
        let max = chrono::Duration::from_std(max_duration).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale: Vec<String> = {
            let conn = self.db.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT run_id FROM sync_runs
                     WHERE status = 'started' AND started_at < ?1
                     ORDER BY started_at",
                )
                .map_err(StorageError::from)?;
            let ids = stmt
                .query_map([encode_ts(cutoff)], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(StorageError::from)?;
            ids
        };

        let mut abandoned = Vec::with_capacity(stale.len());
        for run_id in stale {
            let message = format!(
                "run abandoned after exceeding {}s without finishing",
                max_duration.as_secs()
            );
            // a run finishing concurrently is not an error here
            match self.record_error(&run_id, RUN_REF, &message) {
                Ok(()) => {}
                Err(LoggerError::AlreadyFinished(_)) | Err(LoggerError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
            match self.finish(&run_id, RunStatus::Failed) {
                Ok(_) => abandoned.push(run_id),
                Err(LoggerError::AlreadyFinished(_)) | Err(LoggerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(abandoned)
    }
}
