//! Access to the local task/timeline store.
//!
//! The engine only needs scoped reads and single-entity writes. Deletions are
//! kept as tombstones so their timestamps can take part in conflict
//! resolution.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{encode_ts, SyncDb};
use crate::entity::LocalEntity;
use crate::error::StorageError;
use crate::types::{EntityKind, SyncScope};

pub trait LocalStore: Send + Sync {
    /// Entities in scope, tombstones included.
    fn list_in_scope(
        &self,
        owner_id: &str,
        scope: &SyncScope,
    ) -> Result<Vec<LocalEntity>, StorageError>;

    fn get(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<LocalEntity>, StorageError>;

    /// Insert or replace by id.
    fn upsert(&self, owner_id: &str, entity: &LocalEntity) -> Result<(), StorageError>;

    /// Tombstone the entity at `at`. Returns `false` if it does not exist.
    fn mark_deleted(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// SQLite-backed [`LocalStore`]. Bodies are stored as JSON.
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: SyncDb,
}

impl SqliteLocalStore {
    pub fn new(db: SyncDb) -> Self {
        Self { db }
    }

    fn decode_all(bodies: Vec<String>) -> Result<Vec<LocalEntity>, StorageError> {
        bodies.iter().map(|b| decode_body(b)).collect()
    }
}

fn decode_body(body: &str) -> Result<LocalEntity, StorageError> {
    serde_json::from_str(body).map_err(|e| StorageError::Corrupt {
        table: "local_entities",
        message: e.to_string(),
    })
}

fn time_bounds(entity: &LocalEntity) -> (Option<String>, Option<String>) {
    match entity {
        LocalEntity::CalendarEvent(e) => (Some(encode_ts(e.start)), Some(encode_ts(e.end))),
        LocalEntity::Task(_) => (None, None),
    }
}

impl LocalStore for SqliteLocalStore {
    fn list_in_scope(
        &self,
        owner_id: &str,
        scope: &SyncScope,
    ) -> Result<Vec<LocalEntity>, StorageError> {
        let conn = self.db.lock()?;
        let bodies = match scope {
            SyncScope::TimeWindow {
                calendar_id,
                start,
                end,
            } => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM local_entities
                     WHERE owner_id = ?1 AND entity_kind = ?2 AND container_id = ?3
                       AND starts_at < ?5 AND ends_at > ?4
                     ORDER BY local_id",
                )?;
                let rows = stmt.query_map(
                    params![
                        owner_id,
                        EntityKind::CalendarEvent.as_str(),
                        calendar_id,
                        encode_ts(*start),
                        encode_ts(*end)
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            SyncScope::TaskList { list_id } => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM local_entities
                     WHERE owner_id = ?1 AND entity_kind = ?2 AND container_id = ?3
                     ORDER BY local_id",
                )?;
                let rows = stmt.query_map(
                    params![owner_id, EntityKind::Task.as_str(), list_id],
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Self::decode_all(bodies)
    }

    fn get(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<LocalEntity>, StorageError> {
        let conn = self.db.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM local_entities
                 WHERE owner_id = ?1 AND entity_kind = ?2 AND local_id = ?3",
                params![owner_id, kind.as_str(), local_id],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode_body).transpose()
    }

    fn upsert(&self, owner_id: &str, entity: &LocalEntity) -> Result<(), StorageError> {
        let body = serde_json::to_string(entity)
            .map_err(|e| StorageError::QueryFailed(format!("encode local entity: {e}")))?;
        let (starts_at, ends_at) = time_bounds(entity);
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO local_entities (owner_id, entity_kind, local_id, container_id, starts_at,
                                         ends_at, updated_at, deleted_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(owner_id, entity_kind, local_id) DO UPDATE SET
                container_id = excluded.container_id,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at,
                body = excluded.body",
            params![
                owner_id,
                entity.kind().as_str(),
                entity.id(),
                entity.container_id(),
                starts_at,
                ends_at,
                encode_ts(entity.updated_at()),
                entity.deleted_at().map(encode_ts),
                body,
            ],
        )?;
        Ok(())
    }

    fn mark_deleted(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(existing) = self.get(owner_id, kind, local_id)? else {
            return Ok(false);
        };
        self.upsert(owner_id, &existing.into_tombstone(at))?;
        Ok(true)
    }
}
