//! Core types for calendar/task synchronization.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::ProviderMetadata;

/// Kind of entity a mapping or run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CalendarEvent,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CalendarEvent => "calendar_event",
            EntityKind::Task => "task",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendar_event" | "calendar" | "event" => Ok(EntityKind::CalendarEvent),
            "task" | "tasks" => Ok(EntityKind::Task),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Which side(s) a run writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToRemote,
    FromRemote,
    Bidirectional,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToRemote => "to_remote",
            Direction::FromRemote => "from_remote",
            Direction::Bidirectional => "bidirectional",
        }
    }

    /// Local changes are pushed to the provider.
    pub fn writes_remote(&self) -> bool {
        matches!(self, Direction::ToRemote | Direction::Bidirectional)
    }

    /// Provider changes are applied to the local store.
    pub fn writes_local(&self) -> bool {
        matches!(self, Direction::FromRemote | Direction::Bidirectional)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_remote" | "push" => Ok(Direction::ToRemote),
            "from_remote" | "pull" => Ok(Direction::FromRemote),
            "bidirectional" | "both" => Ok(Direction::Bidirectional),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Webhook,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Webhook => "webhook",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "webhook" => Ok(Trigger::Webhook),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// The bounded subset of entities a run considers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncScope {
    /// Calendar events overlapping `[start, end)` on one calendar.
    TimeWindow {
        calendar_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Every task on one task list.
    TaskList { list_id: String },
}

impl SyncScope {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            SyncScope::TimeWindow { .. } => EntityKind::CalendarEvent,
            SyncScope::TaskList { .. } => EntityKind::Task,
        }
    }

    /// Calendar id or task list id.
    pub fn target(&self) -> &str {
        match self {
            SyncScope::TimeWindow { calendar_id, .. } => calendar_id,
            SyncScope::TaskList { list_id } => list_id,
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::TimeWindow {
                calendar_id,
                start,
                end,
            } => write!(
                f,
                "calendar:{calendar_id}[{}..{}]",
                start.to_rfc3339(),
                end.to_rfc3339()
            ),
            SyncScope::TaskList { list_id } => write!(f, "tasklist:{list_id}"),
        }
    }
}

/// Durable identity bridge between a local entity and its remote counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub owner_id: String,
    pub entity_kind: EntityKind,
    pub local_id: String,
    pub remote_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_local_version: String,
    pub last_remote_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProviderMetadata>,
}

/// A request to run one sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub owner_id: String,
    pub direction: Direction,
    pub scope: SyncScope,
    pub trigger: Trigger,
}

impl SyncRequest {
    pub fn manual(owner_id: impl Into<String>, direction: Direction, scope: SyncScope) -> Self {
        Self {
            owner_id: owner_id.into(),
            direction,
            scope,
            trigger: Trigger::Manual,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.scope.entity_kind()
    }
}

/// Reference to an item in error records, e.g. `task:local-1` or `task:remote:abc`.
pub fn entity_ref(kind: EntityKind, local_id: Option<&str>, remote_id: Option<&str>) -> String {
    match (local_id, remote_id) {
        (Some(local), _) => format!("{kind}:{local}"),
        (None, Some(remote)) => format!("{kind}:remote:{remote}"),
        (None, None) => kind.to_string(),
    }
}
