//! Conflict resolution between a local and a remote version of one entity.
//!
//! All timestamp policy lives here. The resolver is pure: same inputs, same
//! decision, no I/O.

use std::time::Duration;

use serde::Serialize;

use crate::entity::{EntityField, VersionedEntity};

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "fields", rename_all = "snake_case")]
pub enum Decision {
    KeepLocal,
    KeepRemote,
    /// Remote is the base; the listed fields are taken from local.
    Merge(Vec<EntityField>),
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    tolerance_ms: i64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ConflictResolver {
    pub fn new(clock_skew_tolerance: Duration) -> Self {
        Self {
            tolerance_ms: i64::try_from(clock_skew_tolerance.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Decide which side wins.
    ///
    /// - Newer `updated_at` wins.
    /// - Inside the tolerance window the remote side wins, unless both are
    ///   live and local carries optional fields remote left empty, which
    ///   yields a merge.
    /// - A deletion beats an update only when it is newer outside the window.
    pub fn resolve(&self, local: &VersionedEntity, remote: &VersionedEntity) -> Decision {
        let delta_ms = (local.updated_at - remote.updated_at).num_milliseconds();
        let tied = delta_ms.abs() <= self.tolerance_ms;
        let local_newer = !tied && delta_ms > 0;
        let remote_newer = !tied && delta_ms < 0;

        match (local.tombstone, remote.tombstone) {
            // already gone on both sides
            (true, true) => Decision::KeepRemote,
            (true, false) => {
                if local_newer {
                    Decision::KeepLocal
                } else {
                    Decision::KeepRemote
                }
            }
            (false, true) => {
                if remote_newer {
                    Decision::KeepRemote
                } else {
                    Decision::KeepLocal
                }
            }
            (false, false) => {
                if local_newer {
                    Decision::KeepLocal
                } else if remote_newer {
                    Decision::KeepRemote
                } else {
                    let fields: Vec<EntityField> = local
                        .populated
                        .difference(&remote.populated)
                        .copied()
                        .collect();
                    if fields.is_empty() {
                        Decision::KeepRemote
                    } else {
                        Decision::Merge(fields)
                    }
                }
            }
        }
    }
}
