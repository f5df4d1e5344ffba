//! Local and remote entity shapes.
//!
//! The engine never owns either store. Local entities are read from and
//! written through [`crate::storage::LocalStore`]; remote entities through the
//! adapters. Fields that exist on only one side ride along in
//! [`ProviderMetadata`] so a round trip is lossless.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::provider::wire::{GoogleEvent, GoogleTask};
use crate::types::EntityKind;

/// Format a timestamp as an opaque version marker.
pub fn version_marker(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Provider-only fields preserved across translation, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderMetadata {
    CalendarEvent(CalendarEventMetadata),
    Task(TaskMetadata),
}

impl ProviderMetadata {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ProviderMetadata::CalendarEvent(_) => EntityKind::CalendarEvent,
            ProviderMetadata::Task(_) => EntityKind::Task,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarEventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_cal_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_zone: Option<String>,
    /// Wire fields the engine does not model.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_view_link: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// A task in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTask {
    pub id: String,
    pub list_id: String,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<ProviderMetadata>,
}

/// A timeline event in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEvent {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<ProviderMetadata>,
}

/// Optional fields the resolver considers when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityField {
    Title,
    /// Task notes or event description.
    Body,
    Location,
    Due,
}

/// A local entity of either kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalEntity {
    CalendarEvent(LocalEvent),
    Task(LocalTask),
}

impl LocalEntity {
    pub fn id(&self) -> &str {
        match self {
            LocalEntity::CalendarEvent(e) => &e.id,
            LocalEntity::Task(t) => &t.id,
        }
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        match self {
            LocalEntity::CalendarEvent(e) => e.id = id.into(),
            LocalEntity::Task(t) => t.id = id.into(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            LocalEntity::CalendarEvent(_) => EntityKind::CalendarEvent,
            LocalEntity::Task(_) => EntityKind::Task,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            LocalEntity::CalendarEvent(e) => e.updated_at,
            LocalEntity::Task(t) => t.updated_at,
        }
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            LocalEntity::CalendarEvent(e) => e.deleted_at,
            LocalEntity::Task(t) => t.deleted_at,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Calendar id or task list id the entity belongs to.
    pub fn container_id(&self) -> &str {
        match self {
            LocalEntity::CalendarEvent(e) => &e.calendar_id,
            LocalEntity::Task(t) => &t.list_id,
        }
    }

    pub fn metadata(&self) -> Option<&ProviderMetadata> {
        match self {
            LocalEntity::CalendarEvent(e) => e.metadata.as_ref(),
            LocalEntity::Task(t) => t.metadata.as_ref(),
        }
    }

    /// Opaque revision marker compared against `SyncMapping::last_local_version`.
    pub fn version(&self) -> String {
        version_marker(self.updated_at())
    }

    /// Mark deleted at `at`. Deletion counts as a modification.
    pub fn into_tombstone(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            LocalEntity::CalendarEvent(e) => {
                e.deleted_at = Some(at);
                e.updated_at = at;
            }
            LocalEntity::Task(t) => {
                t.deleted_at = Some(at);
                t.updated_at = at;
            }
        }
        self
    }

    /// Optional fields that carry a non-empty value.
    pub fn populated_fields(&self) -> BTreeSet<EntityField> {
        let mut fields = BTreeSet::new();
        match self {
            LocalEntity::CalendarEvent(e) => {
                if !e.title.trim().is_empty() {
                    fields.insert(EntityField::Title);
                }
                if non_empty(&e.description) {
                    fields.insert(EntityField::Body);
                }
                if non_empty(&e.location) {
                    fields.insert(EntityField::Location);
                }
            }
            LocalEntity::Task(t) => {
                if !t.title.trim().is_empty() {
                    fields.insert(EntityField::Title);
                }
                if non_empty(&t.notes) {
                    fields.insert(EntityField::Body);
                }
                if t.due.is_some() {
                    fields.insert(EntityField::Due);
                }
            }
        }
        fields
    }

    /// Copy `fields` from `source` onto `self`. Kinds must match; otherwise a no-op.
    pub fn overlay_fields(&mut self, source: &LocalEntity, fields: &[EntityField]) {
        match (self, source) {
            (LocalEntity::CalendarEvent(dst), LocalEntity::CalendarEvent(src)) => {
                for field in fields {
                    match field {
                        EntityField::Title => dst.title = src.title.clone(),
                        EntityField::Body => dst.description = src.description.clone(),
                        EntityField::Location => dst.location = src.location.clone(),
                        EntityField::Due => {}
                    }
                }
            }
            (LocalEntity::Task(dst), LocalEntity::Task(src)) => {
                for field in fields {
                    match field {
                        EntityField::Title => dst.title = src.title.clone(),
                        EntityField::Body => dst.notes = src.notes.clone(),
                        EntityField::Due => dst.due = src.due,
                        EntityField::Location => {}
                    }
                }
            }
            _ => {}
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            LocalEntity::CalendarEvent(e) => e.updated_at = at,
            LocalEntity::Task(t) => t.updated_at = at,
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Provider payload of a remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_kind", content = "resource", rename_all = "snake_case")]
pub enum RemotePayload {
    CalendarEvent(GoogleEvent),
    Task(GoogleTask),
}

/// An entity as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub remote_id: String,
    /// Calendar id or task list id the entity was read from.
    pub container_id: String,
    /// Etag, or the provider `updated` timestamp when no etag is present.
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub payload: RemotePayload,
}

impl RemoteEntity {
    pub fn kind(&self) -> EntityKind {
        match self.payload {
            RemotePayload::CalendarEvent(_) => EntityKind::CalendarEvent,
            RemotePayload::Task(_) => EntityKind::Task,
        }
    }
}

/// An item a pull returned that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    /// Provider id, when the payload carried one.
    pub remote_id: Option<String>,
    pub message: String,
}

/// Everything one pull produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pulled {
    pub entities: Vec<RemoteEntity>,
    pub rejected: Vec<RejectedItem>,
}

impl Pulled {
    /// Split per-item translation results into entities and rejections.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = (Option<String>, Result<RemoteEntity, ProviderError>)>,
    {
        let mut pulled = Pulled::default();
        for (remote_id, result) in results {
            match result {
                Ok(entity) => pulled.entities.push(entity),
                Err(e) => pulled.rejected.push(RejectedItem {
                    remote_id,
                    message: e.to_string(),
                }),
            }
        }
        pulled
    }
}

/// Request body produced by `to_remote_shape`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RemoteDraft {
    CalendarEvent(GoogleEvent),
    Task(GoogleTask),
}

/// What a successful push returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub remote_id: String,
    pub version: String,
}

/// The minimal view of one side the conflict resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedEntity {
    pub updated_at: DateTime<Utc>,
    pub tombstone: bool,
    pub populated: BTreeSet<EntityField>,
}

impl VersionedEntity {
    pub fn live(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            tombstone: false,
            populated: BTreeSet::new(),
        }
    }

    pub fn tombstone(deleted_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: deleted_at,
            tombstone: true,
            populated: BTreeSet::new(),
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = EntityField>) -> Self {
        self.populated.extend(fields);
        self
    }

    pub fn from_local(local: &LocalEntity) -> Self {
        Self {
            updated_at: local.updated_at(),
            tombstone: local.is_tombstone(),
            populated: local.populated_fields(),
        }
    }

    /// Build from a remote entity and its local-shaped translation (for field presence).
    pub fn from_remote(remote: &RemoteEntity, translated: Option<&LocalEntity>) -> Self {
        Self {
            updated_at: remote.updated_at,
            tombstone: remote.deleted,
            populated: translated.map(|l| l.populated_fields()).unwrap_or_default(),
        }
    }
}
