//! Tests for conflict_resolver module.

#[cfg(test)]
mod tests {
    use super::super::conflict_resolver::*;
    use crate::entity::{EntityField, VersionedEntity};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_tie_within_tolerance_goes_to_remote() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::live(base() + Duration::milliseconds(1500));
        let remote = VersionedEntity::live(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let resolver = ConflictResolver::default();
        let remote = VersionedEntity::live(base());
        let at_edge = VersionedEntity::live(base() + Duration::seconds(2));
        let past_edge = VersionedEntity::live(base() + Duration::milliseconds(2001));
        assert_eq!(resolver.resolve(&at_edge, &remote), Decision::KeepRemote);
        assert_eq!(resolver.resolve(&past_edge, &remote), Decision::KeepLocal);
    }

    #[test]
    fn test_custom_tolerance() {
        let resolver = ConflictResolver::new(std::time::Duration::from_secs(30));
        let local = VersionedEntity::live(base() + Duration::seconds(20));
        let remote = VersionedEntity::live(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }

    #[test]
    fn test_tie_merges_fields_remote_left_empty() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::live(base())
            .with_fields([EntityField::Title, EntityField::Body, EntityField::Due]);
        let remote = VersionedEntity::live(base() + Duration::seconds(1))
            .with_fields([EntityField::Title]);
        assert_eq!(
            resolver.resolve(&local, &remote),
            Decision::Merge(vec![EntityField::Body, EntityField::Due])
        );
    }

    #[test]
    fn test_no_merge_outside_tie_window() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::live(base()).with_fields([EntityField::Body]);
        let remote = VersionedEntity::live(base() + Duration::minutes(5));
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }

    #[test]
    fn test_newer_deletion_wins() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::tombstone(base() + Duration::minutes(1));
        let remote = VersionedEntity::live(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepLocal);

        let local = VersionedEntity::live(base());
        let remote = VersionedEntity::tombstone(base() + Duration::minutes(1));
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }

    #[test]
    fn test_newer_update_resurrects() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::tombstone(base());
        let remote = VersionedEntity::live(base() + Duration::minutes(1));
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);

        let local = VersionedEntity::live(base() + Duration::minutes(1));
        let remote = VersionedEntity::tombstone(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepLocal);
    }

    #[test]
    fn test_deletion_inside_tie_window_loses() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::live(base());
        let remote = VersionedEntity::tombstone(base() + Duration::seconds(1));
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepLocal);

        let local = VersionedEntity::tombstone(base() + Duration::seconds(1))
            .with_fields([EntityField::Body]);
        let remote = VersionedEntity::live(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }

    #[test]
    fn test_both_deleted_keeps_remote() {
        let resolver = ConflictResolver::default();
        let local = VersionedEntity::tombstone(base() + Duration::hours(1));
        let remote = VersionedEntity::tombstone(base());
        assert_eq!(resolver.resolve(&local, &remote), Decision::KeepRemote);
    }
}
