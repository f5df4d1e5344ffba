//! Tests for mapping_store module.

#[cfg(test)]
mod tests {
    use super::super::mapping_store::*;
    use super::super::SyncDb;
    use crate::entity::{ProviderMetadata, TaskMetadata};
    use crate::error::MappingError;
    use crate::types::{EntityKind, SyncMapping};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn store() -> SqliteMappingStore {
        SyncDb::open_memory().unwrap().mappings()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn mapping(local: &str, remote: &str, synced: DateTime<Utc>) -> SyncMapping {
        SyncMapping {
            owner_id: "owner-1".to_string(),
            entity_kind: EntityKind::Task,
            local_id: local.to_string(),
            remote_id: remote.to_string(),
            last_synced_at: synced,
            last_local_version: "l1".to_string(),
            last_remote_version: "r1".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_upsert_then_get_by_both_keys() {
        let store = store();
        let m = mapping("t1", "r1", at(9));
        store.upsert(&m).unwrap();

        assert_eq!(store.get("owner-1", EntityKind::Task, "t1").unwrap(), Some(m.clone()));
        assert_eq!(
            store.get_by_remote_id("owner-1", EntityKind::Task, "r1").unwrap(),
            Some(m)
        );
        assert!(store.get("owner-2", EntityKind::Task, "t1").unwrap().is_none());
        assert!(store
            .get("owner-1", EntityKind::CalendarEvent, "t1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_upsert_same_key_overwrites() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(9))).unwrap();
        let mut updated = mapping("t1", "r1", at(10));
        updated.last_remote_version = "r2".to_string();
        store.upsert(&updated).unwrap();

        let all = store.list("owner-1", EntityKind::Task).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_remote_version, "r2");
    }

    #[test]
    fn test_metadata_round_trips() {
        let store = store();
        let mut m = mapping("t1", "r1", at(9));
        m.metadata = Some(ProviderMetadata::Task(TaskMetadata {
            etag: Some("\"abc\"".to_string()),
            position: Some("00001".to_string()),
            ..Default::default()
        }));
        store.upsert(&m).unwrap();
        let loaded = store.get("owner-1", EntityKind::Task, "t1").unwrap().unwrap();
        assert_eq!(loaded.metadata, m.metadata);
    }

    #[test]
    fn test_cas_on_absence() {
        let store = store();
        let m = mapping("t1", "r1", at(9));
        store.compare_and_set(None, &m).unwrap();
        let err = store.compare_and_set(None, &m).unwrap_err();
        assert!(matches!(err, MappingError::StaleWrite { .. }));
    }

    #[test]
    fn test_cas_detects_moved_row() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(9))).unwrap();

        store
            .compare_and_set(Some(at(9)), &mapping("t1", "r1", at(10)))
            .unwrap();
        // a second writer still holding the 09:00 read loses
        let err = store
            .compare_and_set(Some(at(9)), &mapping("t1", "r1", at(11)))
            .unwrap_err();
        assert!(matches!(err, MappingError::StaleWrite { .. }));
        let stored = store.get("owner-1", EntityKind::Task, "t1").unwrap().unwrap();
        assert_eq!(stored.last_synced_at, at(10));
    }

    #[test]
    fn test_cas_on_missing_row_is_stale() {
        let store = store();
        let err = store
            .compare_and_set(Some(at(9)), &mapping("t1", "r1", at(10)))
            .unwrap_err();
        assert!(matches!(err, MappingError::StaleWrite { .. }));
    }

    #[test]
    fn test_remote_collision_older_claimant_loses() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(10))).unwrap();

        let err = store.upsert(&mapping("t2", "r1", at(9))).unwrap_err();
        match err {
            MappingError::Conflict {
                remote_id,
                existing_local_id,
                incoming_local_id,
            } => {
                assert_eq!(remote_id, "r1");
                assert_eq!(existing_local_id, "t1");
                assert_eq!(incoming_local_id, "t2");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let owner = store.get_by_remote_id("owner-1", EntityKind::Task, "r1").unwrap();
        assert_eq!(owner.unwrap().local_id, "t1");
        let flagged = store.list_flagged("owner-1").unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].flagged_local_id, "t2");
        assert_eq!(flagged[0].canonical_local_id, "t1");
    }

    #[test]
    fn test_remote_collision_newer_claimant_wins() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(9))).unwrap();
        store.upsert(&mapping("t2", "r1", at(10))).unwrap();

        assert!(store.get("owner-1", EntityKind::Task, "t1").unwrap().is_none());
        let owner = store.get_by_remote_id("owner-1", EntityKind::Task, "r1").unwrap();
        assert_eq!(owner.unwrap().local_id, "t2");

        let flagged = store.list_flagged("owner-1").unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].flagged_local_id, "t1");
        assert!(store.resolve_flag(flagged[0].id).unwrap());
        assert!(store.list_flagged("owner-1").unwrap().is_empty());
    }

    #[test]
    fn test_same_remote_id_for_different_owners_is_fine() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(9))).unwrap();
        let mut other = mapping("t1", "r1", at(9));
        other.owner_id = "owner-2".to_string();
        store.upsert(&other).unwrap();
        assert!(store.list_flagged("owner-1").unwrap().is_empty());
        assert!(store.list_flagged("owner-2").unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_list_stale() {
        let store = store();
        store.upsert(&mapping("t1", "r1", at(8))).unwrap();
        store.upsert(&mapping("t2", "r2", at(12))).unwrap();

        let stale = store
            .list_stale("owner-1", EntityKind::Task, at(12) - Duration::minutes(1))
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].local_id, "t1");

        assert!(store.delete("owner-1", EntityKind::Task, "t1").unwrap());
        assert!(!store.delete("owner-1", EntityKind::Task, "t1").unwrap());
        assert_eq!(store.list("owner-1", EntityKind::Task).unwrap().len(), 1);
    }
}
