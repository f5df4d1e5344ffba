//! Database schema migrations for the sync database.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const CURRENT_VERSION: i32 = 3;

/// Apply all pending migrations.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 for a fresh database.
fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    match conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    }) {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: mappings, run log and leases.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_mappings (
            owner_id            TEXT NOT NULL,
            entity_kind         TEXT NOT NULL,
            local_id            TEXT NOT NULL,
            remote_id           TEXT NOT NULL,
            last_synced_at      TEXT NOT NULL,
            last_local_version  TEXT NOT NULL,
            last_remote_version TEXT NOT NULL,
            metadata            TEXT,
            PRIMARY KEY (owner_id, entity_kind, local_id),
            UNIQUE (owner_id, entity_kind, remote_id)
        );

        CREATE INDEX IF NOT EXISTS idx_sync_mappings_synced
            ON sync_mappings(owner_id, entity_kind, last_synced_at);

        CREATE TABLE IF NOT EXISTS mapping_conflicts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id          TEXT NOT NULL,
            entity_kind       TEXT NOT NULL,
            remote_id         TEXT NOT NULL,
            canonical_local_id TEXT NOT NULL,
            flagged_local_id  TEXT NOT NULL,
            detected_at       TEXT NOT NULL,
            resolved_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_mapping_conflicts_owner
            ON mapping_conflicts(owner_id, resolved_at);

        CREATE TABLE IF NOT EXISTS sync_runs (
            run_id        TEXT PRIMARY KEY,
            owner_id      TEXT NOT NULL,
            provider      TEXT NOT NULL,
            trigger       TEXT NOT NULL,
            direction     TEXT NOT NULL,
            entity_kind   TEXT NOT NULL,
            status        TEXT NOT NULL,
            items_created INTEGER NOT NULL DEFAULT 0,
            items_updated INTEGER NOT NULL DEFAULT 0,
            items_deleted INTEGER NOT NULL DEFAULT 0,
            started_at    TEXT NOT NULL,
            completed_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_runs_owner_started
            ON sync_runs(owner_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_sync_runs_status
            ON sync_runs(status, started_at);

        CREATE TABLE IF NOT EXISTS sync_run_errors (
            run_id      TEXT NOT NULL REFERENCES sync_runs(run_id) ON DELETE CASCADE,
            seq         INTEGER NOT NULL,
            entity_ref  TEXT NOT NULL,
            message     TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (run_id, seq)
        );

        CREATE TABLE IF NOT EXISTS sync_leases (
            owner_id    TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            holder      TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            PRIMARY KEY (owner_id, entity_kind)
        );",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()
}

/// Migration v2: webhook subscriptions and delivery de-duplication.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
            channel_id  TEXT PRIMARY KEY,
            resource_id TEXT NOT NULL,
            owner_id    TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            target      TEXT NOT NULL,
            token       TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_subscriptions_expiry
            ON webhook_subscriptions(expires_at);

        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            channel_id     TEXT NOT NULL,
            message_number INTEGER NOT NULL,
            resource_state TEXT NOT NULL,
            received_at    TEXT NOT NULL,
            PRIMARY KEY (channel_id, message_number)
        );",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    tx.commit()
}

/// Migration v3: local entity table.
///
/// The production local store lives elsewhere; this table backs the CLI and
/// the HTTP server when they run standalone.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS local_entities (
            owner_id    TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            local_id    TEXT NOT NULL,
            container_id TEXT NOT NULL,
            starts_at   TEXT,
            ends_at     TEXT,
            updated_at  TEXT NOT NULL,
            deleted_at  TEXT,
            body        TEXT NOT NULL,
            PRIMARY KEY (owner_id, entity_kind, local_id)
        );

        CREATE INDEX IF NOT EXISTS idx_local_entities_container
            ON local_entities(owner_id, entity_kind, container_id);",
    )?;

    set_schema_version(&tx, 3)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_VERSION);
        for table in [
            "sync_mappings",
            "mapping_conflicts",
            "sync_runs",
            "sync_run_errors",
            "sync_leases",
            "webhook_subscriptions",
            "webhook_deliveries",
            "local_entities",
        ] {
            assert!(table_exists(&conn, table), "missing {table}");
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn upgrades_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema_version_table(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        assert!(!table_exists(&conn, "webhook_subscriptions"));
        migrate(&conn).unwrap();
        assert!(table_exists(&conn, "webhook_subscriptions"));
        assert!(table_exists(&conn, "local_entities"));
    }
}
