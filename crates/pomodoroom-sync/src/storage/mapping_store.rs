//! Durable local-id ⇄ remote-id mappings.
//!
//! Uniqueness holds on both keys: one row per `(owner, kind, local_id)` and
//! one row per `(owner, kind, remote_id)`. When two local entities claim the
//! same remote id, the more recently synced claimant keeps the row and the
//! other is written to `mapping_conflicts` for manual reconciliation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::warn;

use super::{decode_ts, encode_ts, SyncDb};
use crate::entity::ProviderMetadata;
use crate::error::{MappingError, StorageError};
use crate::types::{EntityKind, SyncMapping};

/// Mapping persistence. Every operation is keyed by owner.
pub trait MappingStore: Send + Sync {
    fn get(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<SyncMapping>, StorageError>;

    fn get_by_remote_id(
        &self,
        owner_id: &str,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<SyncMapping>, StorageError>;

    /// Insert or overwrite by local key.
    fn upsert(&self, mapping: &SyncMapping) -> Result<(), MappingError>;

    /// Write only if the stored `last_synced_at` still equals `expected`
    /// (`None` = the row must not exist yet).
    fn compare_and_set(
        &self,
        expected: Option<DateTime<Utc>>,
        mapping: &SyncMapping,
    ) -> Result<(), MappingError>;

    /// Returns whether a row was removed.
    fn delete(&self, owner_id: &str, kind: EntityKind, local_id: &str)
        -> Result<bool, StorageError>;

    fn list(&self, owner_id: &str, kind: EntityKind) -> Result<Vec<SyncMapping>, StorageError>;

    /// Mappings not synced since `older_than`.
    fn list_stale(
        &self,
        owner_id: &str,
        kind: EntityKind,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SyncMapping>, StorageError>;

    /// Unresolved remote-id collisions.
    fn list_flagged(&self, owner_id: &str) -> Result<Vec<FlaggedMapping>, StorageError>;
}

/// A remote-id collision awaiting manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedMapping {
    pub id: i64,
    pub owner_id: String,
    pub entity_kind: EntityKind,
    pub remote_id: String,
    pub canonical_local_id: String,
    pub flagged_local_id: String,
    pub detected_at: DateTime<Utc>,
}

enum Expect {
    Any,
    Absent,
    SyncedAt(DateTime<Utc>),
}

/// SQLite-backed [`MappingStore`].
#[derive(Clone)]
pub struct SqliteMappingStore {
    db: SyncDb,
}

const COLUMNS: &str = "owner_id, entity_kind, local_id, remote_id, last_synced_at,
                       last_local_version, last_remote_version, metadata";

struct RawMapping {
    owner_id: String,
    entity_kind: String,
    local_id: String,
    remote_id: String,
    last_synced_at: String,
    last_local_version: String,
    last_remote_version: String,
    metadata: Option<String>,
}

impl RawMapping {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner_id: row.get(0)?,
            entity_kind: row.get(1)?,
            local_id: row.get(2)?,
            remote_id: row.get(3)?,
            last_synced_at: row.get(4)?,
            last_local_version: row.get(5)?,
            last_remote_version: row.get(6)?,
            metadata: row.get(7)?,
        })
    }

    fn decode(self) -> Result<SyncMapping, StorageError> {
        let entity_kind = self
            .entity_kind
            .parse::<EntityKind>()
            .map_err(|message| StorageError::Corrupt {
                table: "sync_mappings",
                message,
            })?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<ProviderMetadata>)
            .transpose()
            .map_err(|e| StorageError::Corrupt {
                table: "sync_mappings",
                message: format!("bad metadata for '{}': {e}", self.local_id),
            })?;

        Ok(SyncMapping {
            owner_id: self.owner_id,
            entity_kind,
            last_synced_at: decode_ts("sync_mappings", &self.last_synced_at)?,
            local_id: self.local_id,
            remote_id: self.remote_id,
            last_local_version: self.last_local_version,
            last_remote_version: self.last_remote_version,
            metadata,
        })
    }
}

fn encode_metadata(mapping: &SyncMapping) -> Result<Option<String>, StorageError> {
    mapping
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::QueryFailed(format!("encode metadata: {e}")))
}

impl SqliteMappingStore {
    pub fn new(db: SyncDb) -> Self {
        Self { db }
    }

    fn query_many(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SyncMapping>, StorageError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawMapping::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawMapping::decode).collect()
    }

    fn write(&self, expect: Expect, mapping: &SyncMapping) -> Result<(), MappingError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(StorageError::from)?;

        let kind = mapping.entity_kind.as_str();
        let current: Option<String> = tx
            .query_row(
                "SELECT last_synced_at FROM sync_mappings
                 WHERE owner_id = ?1 AND entity_kind = ?2 AND local_id = ?3",
                params![mapping.owner_id, kind, mapping.local_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;

        let matches = match (&expect, current.as_deref()) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Absent, Some(_)) => false,
            (Expect::SyncedAt(_), None) => false,
            (Expect::SyncedAt(expected), Some(stored)) => {
                decode_ts("sync_mappings", stored)? == *expected
            }
        };
        if !matches {
            return Err(MappingError::StaleWrite {
                local_id: mapping.local_id.clone(),
            });
        }

        if let Some(loser) = resolve_remote_claim(&tx, mapping)? {
            tx.commit().map_err(StorageError::from)?;
            return Err(loser);
        }

        tx.execute(
            "INSERT INTO sync_mappings (owner_id, entity_kind, local_id, remote_id, last_synced_at,
                                        last_local_version, last_remote_version, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(owner_id, entity_kind, local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                last_synced_at = excluded.last_synced_at,
                last_local_version = excluded.last_local_version,
                last_remote_version = excluded.last_remote_version,
                metadata = excluded.metadata",
            params![
                mapping.owner_id,
                kind,
                mapping.local_id,
                mapping.remote_id,
                encode_ts(mapping.last_synced_at),
                mapping.last_local_version,
                mapping.last_remote_version,
                encode_metadata(mapping)?,
            ],
        )
        .map_err(StorageError::from)?;

        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Mark a flagged collision as handled.
    pub fn resolve_flag(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE mapping_conflicts SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
            params![encode_ts(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }
}

/// Settle a collision on `remote_id`. Returns the error for the losing write,
/// or `None` when the incoming mapping may proceed.
fn resolve_remote_claim(
    tx: &Transaction<'_>,
    mapping: &SyncMapping,
) -> Result<Option<MappingError>, StorageError> {
    let kind = mapping.entity_kind.as_str();
    let claimant: Option<(String, String)> = tx
        .query_row(
            "SELECT local_id, last_synced_at FROM sync_mappings
             WHERE owner_id = ?1 AND entity_kind = ?2 AND remote_id = ?3 AND local_id != ?4",
            params![mapping.owner_id, kind, mapping.remote_id, mapping.local_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((existing_local_id, existing_synced)) = claimant else {
        return Ok(None);
    };
    let existing_synced = decode_ts("sync_mappings", &existing_synced)?;
    let incoming_wins = mapping.last_synced_at > existing_synced;

    let (canonical, flagged) = if incoming_wins {
        (mapping.local_id.as_str(), existing_local_id.as_str())
    } else {
        (existing_local_id.as_str(), mapping.local_id.as_str())
    };

    tx.execute(
        "INSERT INTO mapping_conflicts
            (owner_id, entity_kind, remote_id, canonical_local_id, flagged_local_id, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            mapping.owner_id,
            kind,
            mapping.remote_id,
            canonical,
            flagged,
            encode_ts(Utc::now())
        ],
    )?;

    warn!(
        owner_id = %mapping.owner_id,
        entity_kind = kind,
        remote_id = %mapping.remote_id,
        canonical,
        flagged,
        "remote id claimed by two local entities"
    );

    if incoming_wins {
        tx.execute(
            "DELETE FROM sync_mappings WHERE owner_id = ?1 AND entity_kind = ?2 AND local_id = ?3",
            params![mapping.owner_id, kind, existing_local_id],
        )?;
        Ok(None)
    } else {
        Ok(Some(MappingError::Conflict {
            remote_id: mapping.remote_id.clone(),
            existing_local_id,
            incoming_local_id: mapping.local_id.clone(),
        }))
    }
}

impl MappingStore for SqliteMappingStore {
    fn get(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<Option<SyncMapping>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_mappings
             WHERE owner_id = ?1 AND entity_kind = ?2 AND local_id = ?3"
        );
        Ok(self
            .query_many(&sql, params![owner_id, kind.as_str(), local_id])?
            .into_iter()
            .next())
    }

    fn get_by_remote_id(
        &self,
        owner_id: &str,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<SyncMapping>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_mappings
             WHERE owner_id = ?1 AND entity_kind = ?2 AND remote_id = ?3"
        );
        Ok(self
            .query_many(&sql, params![owner_id, kind.as_str(), remote_id])?
            .into_iter()
            .next())
    }

    fn upsert(&self, mapping: &SyncMapping) -> Result<(), MappingError> {
        self.write(Expect::Any, mapping)
    }

    fn compare_and_set(
        &self,
        expected: Option<DateTime<Utc>>,
        mapping: &SyncMapping,
    ) -> Result<(), MappingError> {
        let expect = match expected {
            Some(ts) => Expect::SyncedAt(ts),
            None => Expect::Absent,
        };
        self.write(expect, mapping)
    }

    fn delete(
        &self,
        owner_id: &str,
        kind: EntityKind,
        local_id: &str,
    ) -> Result<bool, StorageError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM sync_mappings WHERE owner_id = ?1 AND entity_kind = ?2 AND local_id = ?3",
            params![owner_id, kind.as_str(), local_id],
        )?;
        Ok(removed > 0)
    }

    fn list(&self, owner_id: &str, kind: EntityKind) -> Result<Vec<SyncMapping>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_mappings
             WHERE owner_id = ?1 AND entity_kind = ?2
             ORDER BY local_id"
        );
        self.query_many(&sql, params![owner_id, kind.as_str()])
    }

    fn list_stale(
        &self,
        owner_id: &str,
        kind: EntityKind,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SyncMapping>, StorageError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_mappings
             WHERE owner_id = ?1 AND entity_kind = ?2 AND last_synced_at < ?3
             ORDER BY last_synced_at"
        );
        self.query_many(&sql, params![owner_id, kind.as_str(), encode_ts(older_than)])
    }

    fn list_flagged(&self, owner_id: &str) -> Result<Vec<FlaggedMapping>, StorageError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, entity_kind, remote_id, canonical_local_id, flagged_local_id,
                    detected_at
             FROM mapping_conflicts
             WHERE owner_id = ?1 AND resolved_at IS NULL
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([owner_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, owner_id, kind, remote_id, canonical_local_id, flagged_local_id, detected)| {
                    Ok(FlaggedMapping {
                        id,
                        owner_id,
                        entity_kind: kind.parse().map_err(|message| StorageError::Corrupt {
                            table: "mapping_conflicts",
                            message,
                        })?,
                        remote_id,
                        canonical_local_id,
                        flagged_local_id,
                        detected_at: decode_ts("mapping_conflicts", &detected)?,
                    })
                },
            )
            .collect()
    }
}
