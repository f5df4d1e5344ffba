//! Per-scope run leases.
//!
//! A lease is a row in `sync_leases` keyed by `(owner_id, entity_kind)`.
//! Acquisition is a single conditional upsert: it succeeds when no row exists
//! or the existing row has expired. A crashed holder therefore blocks the
//! scope for at most one TTL.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{decode_ts, encode_ts, SyncDb};
use crate::error::StorageError;
use crate::types::EntityKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub owner_id: String,
    pub entity_kind: EntityKind,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

pub trait LeaseStore: Send + Sync {
    /// Take the lease for `holder`. Returns `false` if a live lease is held by anyone.
    fn try_acquire(
        &self,
        owner_id: &str,
        kind: EntityKind,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Drop the lease if `holder` still owns it.
    fn release(&self, owner_id: &str, kind: EntityKind, holder: &str)
        -> Result<bool, StorageError>;

    fn current(&self, owner_id: &str, kind: EntityKind) -> Result<Option<Lease>, StorageError>;

    fn is_held(
        &self,
        owner_id: &str,
        kind: EntityKind,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        Ok(self
            .current(owner_id, kind)?
            .map(|lease| lease.is_live(now))
            .unwrap_or(false))
    }
}

#[derive(Clone)]
pub struct SqliteLeaseStore {
    db: SyncDb,
}

impl SqliteLeaseStore {
    pub fn new(db: SyncDb) -> Self {
        Self { db }
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn try_acquire(
        &self,
        owner_id: &str,
        kind: EntityKind,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "INSERT INTO sync_leases (owner_id, entity_kind, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(owner_id, entity_kind) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE sync_leases.expires_at <= excluded.acquired_at",
            params![
                owner_id,
                kind.as_str(),
                holder,
                encode_ts(now),
                encode_ts(now + ttl)
            ],
        )?;
        Ok(changed == 1)
    }

    fn release(
        &self,
        owner_id: &str,
        kind: EntityKind,
        holder: &str,
    ) -> Result<bool, StorageError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM sync_leases WHERE owner_id = ?1 AND entity_kind = ?2 AND holder = ?3",
            params![owner_id, kind.as_str(), holder],
        )?;
        Ok(removed == 1)
    }

    fn current(&self, owner_id: &str, kind: EntityKind) -> Result<Option<Lease>, StorageError> {
        let conn = self.db.lock()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT holder, acquired_at, expires_at FROM sync_leases
                 WHERE owner_id = ?1 AND entity_kind = ?2",
                params![owner_id, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(holder, acquired_at, expires_at)| {
            Ok(Lease {
                owner_id: owner_id.to_string(),
                entity_kind: kind,
                holder,
                acquired_at: decode_ts("sync_leases", &acquired_at)?,
                expires_at: decode_ts("sync_leases", &expires_at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn second_holder_is_refused_while_live() {
        let leases = SyncDb::open_memory().unwrap().leases();
        let ttl = Duration::minutes(15);
        assert!(leases
            .try_acquire("o1", EntityKind::Task, "run-a", now(), ttl)
            .unwrap());
        assert!(!leases
            .try_acquire("o1", EntityKind::Task, "run-b", now() + Duration::minutes(1), ttl)
            .unwrap());
        assert!(leases.is_held("o1", EntityKind::Task, now()).unwrap());
    }

    #[test]
    fn scopes_are_independent() {
        let leases = SyncDb::open_memory().unwrap().leases();
        let ttl = Duration::minutes(15);
        assert!(leases
            .try_acquire("o1", EntityKind::Task, "a", now(), ttl)
            .unwrap());
        assert!(leases
            .try_acquire("o1", EntityKind::CalendarEvent, "b", now(), ttl)
            .unwrap());
        assert!(leases
            .try_acquire("o2", EntityKind::Task, "c", now(), ttl)
            .unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let leases = SyncDb::open_memory().unwrap().leases();
        let ttl = Duration::minutes(15);
        assert!(leases
            .try_acquire("o1", EntityKind::Task, "crashed", now(), ttl)
            .unwrap());
        let later = now() + Duration::minutes(16);
        assert!(!leases.is_held("o1", EntityKind::Task, later).unwrap());
        assert!(leases
            .try_acquire("o1", EntityKind::Task, "fresh", later, ttl)
            .unwrap());
        assert_eq!(
            leases.current("o1", EntityKind::Task).unwrap().unwrap().holder,
            "fresh"
        );
        // the old holder can no longer release it
        assert!(!leases.release("o1", EntityKind::Task, "crashed").unwrap());
    }

    #[test]
    fn release_frees_the_scope() {
        let leases = SyncDb::open_memory().unwrap().leases();
        let ttl = Duration::minutes(15);
        leases
            .try_acquire("o1", EntityKind::Task, "a", now(), ttl)
            .unwrap();
        assert!(leases.release("o1", EntityKind::Task, "a").unwrap());
        assert!(leases.current("o1", EntityKind::Task).unwrap().is_none());
        assert!(leases
            .try_acquire("o1", EntityKind::Task, "b", now(), ttl)
            .unwrap());
    }
}
