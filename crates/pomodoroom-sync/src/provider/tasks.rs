//! Task adapter: local tasks ⇄ Google Tasks.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use tracing::warn;

use super::client::{endpoint, GoogleClient};
use super::wire::GoogleTask;
use super::{parse_rfc3339, remote_version};
use crate::config::ProviderConfig;
use crate::entity::{
    LocalEntity, LocalTask, ProviderMetadata, Pulled, PushReceipt, RemoteDraft, RemoteEntity,
    RemotePayload, TaskMetadata,
};
use crate::error::ProviderError;
use crate::sync::adapter::EntityAdapter;
use crate::types::{EntityKind, SyncScope};

const STATUS_COMPLETED: &str = "completed";
const STATUS_NEEDS_ACTION: &str = "needsAction";

pub struct GoogleTasksAdapter {
    client: GoogleClient,
    base_url: String,
    page_size: u32,
}

impl GoogleTasksAdapter {
    pub fn new(client: GoogleClient, base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            page_size,
        }
    }

    pub fn from_config(client: GoogleClient, cfg: &ProviderConfig) -> Self {
        Self::new(client, cfg.tasks_api_base.clone(), cfg.tasks_page_size)
    }

    fn tasks_url(&self, list_id: &str) -> String {
        endpoint(&self.base_url, &["lists", list_id, "tasks"])
    }

    fn task_url(&self, list_id: &str, task_id: &str) -> String {
        endpoint(&self.base_url, &["lists", list_id, "tasks", task_id])
    }

    fn list_of(scope: &SyncScope) -> Result<&str, ProviderError> {
        match scope {
            SyncScope::TaskList { list_id } => Ok(list_id),
            other => Err(ProviderError::permanent(format!(
                "task adapter cannot handle scope {other}"
            ))),
        }
    }
}

/// Wrap a wire task as a [`RemoteEntity`].
pub fn remote_from_task(list_id: &str, task: GoogleTask) -> Result<RemoteEntity, ProviderError> {
    let remote_id = task
        .id
        .clone()
        .ok_or_else(|| ProviderError::permanent("task without id"))?;
    let updated = task
        .updated
        .as_deref()
        .ok_or_else(|| ProviderError::permanent(format!("task {remote_id} has no updated time")))?;
    let updated_at = parse_rfc3339("updated", updated)?;

    Ok(RemoteEntity {
        version: remote_version(task.etag.as_deref(), task.updated.as_deref()),
        container_id: list_id.to_string(),
        updated_at,
        deleted: task.deleted,
        remote_id,
        payload: RemotePayload::Task(task),
    })
}

fn optional_time(field: &str, raw: &Option<String>) -> Result<Option<DateTime<Utc>>, ProviderError> {
    raw.as_deref().map(|v| parse_rfc3339(field, v)).transpose()
}

fn wire_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl EntityAdapter for GoogleTasksAdapter {
    fn entity_kind(&self) -> EntityKind {
        EntityKind::Task
    }

    async fn pull(
        &self,
        owner_id: &str,
        scope: &SyncScope,
    ) -> Result<Pulled, ProviderError> {
        let list_id = Self::list_of(scope)?;
        let query = [
            ("showDeleted", "true".to_string()),
            ("showHidden", "true".to_string()),
            ("showCompleted", "true".to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        let tasks: Vec<GoogleTask> = self
            .client
            .list_all(owner_id, &self.tasks_url(list_id), &query)
            .await?;

        let pulled = Pulled::from_results(
            tasks
                .into_iter()
                .map(|task| (task.id.clone(), remote_from_task(list_id, task))),
        );
        if !pulled.rejected.is_empty() {
            warn!(owner_id, list_id, rejected = pulled.rejected.len(), "malformed tasks in pull");
        }
        Ok(pulled)
    }

    async fn fetch(
        &self,
        owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<Option<RemoteEntity>, ProviderError> {
        let list_id = Self::list_of(scope)?;
        let task: Option<GoogleTask> = self
            .client
            .get_optional(owner_id, &self.task_url(list_id, remote_id))
            .await?;
        task.map(|t| remote_from_task(list_id, t)).transpose()
    }

    async fn push(
        &self,
        owner_id: &str,
        local: &LocalEntity,
        remote_id: Option<&str>,
    ) -> Result<PushReceipt, ProviderError> {
        let RemoteDraft::Task(mut draft) = self.to_remote_shape(local)? else {
            return Err(ProviderError::permanent("task adapter produced a non-task draft"));
        };
        let list_id = local.container_id();

        let saved: GoogleTask = match remote_id {
            Some(id) => {
                // tasks.update requires the id in the body
                draft.id = Some(id.to_string());
                self.client
                    .send_json(owner_id, Method::PUT, &self.task_url(list_id, id), &draft)
                    .await?
            }
            None => {
                self.client
                    .send_json(owner_id, Method::POST, &self.tasks_url(list_id), &draft)
                    .await?
            }
        };

        let remote_id = saved
            .id
            .clone()
            .ok_or_else(|| ProviderError::permanent("provider response without task id"))?;
        Ok(PushReceipt {
            remote_id,
            version: remote_version(saved.etag.as_deref(), saved.updated.as_deref()),
        })
    }

    async fn remove(
        &self,
        owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<(), ProviderError> {
        let list_id = Self::list_of(scope)?;
        self.client
            .delete(owner_id, &self.task_url(list_id, remote_id))
            .await
    }

    fn to_local_shape(&self, remote: &RemoteEntity) -> Result<LocalEntity, ProviderError> {
        let RemotePayload::Task(task) = &remote.payload else {
            return Err(ProviderError::permanent(format!(
                "expected task, got {}",
                remote.kind()
            )));
        };

        let completed = task.status.as_deref() == Some(STATUS_COMPLETED);
        let metadata = TaskMetadata {
            etag: task.etag.clone(),
            parent: task.parent.clone(),
            position: task.position.clone(),
            web_view_link: task.web_view_link.clone(),
            extra: task.extra.clone(),
        };

        Ok(LocalEntity::Task(LocalTask {
            id: String::new(),
            list_id: remote.container_id.clone(),
            title: task.title.clone().unwrap_or_default(),
            notes: task.notes.clone().filter(|n| !n.is_empty()),
            due: optional_time("due", &task.due)?,
            completed,
            completed_at: if completed {
                optional_time("completed", &task.completed)?
            } else {
                None
            },
            updated_at: remote.updated_at,
            deleted_at: remote.deleted.then_some(remote.updated_at),
            metadata: Some(ProviderMetadata::Task(metadata)),
        }))
    }

    fn to_remote_shape(&self, local: &LocalEntity) -> Result<RemoteDraft, ProviderError> {
        let LocalEntity::Task(task) = local else {
            return Err(ProviderError::permanent(format!(
                "expected task, got {}",
                local.kind()
            )));
        };
        if task.deleted_at.is_some() {
            return Err(ProviderError::permanent("cannot push a deleted task"));
        }

        let extra = match &task.metadata {
            Some(ProviderMetadata::Task(m)) => m.extra.clone(),
            _ => Default::default(),
        };

        // parent and position are moved through tasks.move, not update
        Ok(RemoteDraft::Task(GoogleTask {
            title: Some(task.title.clone()),
            notes: task.notes.clone(),
            status: Some(
                if task.completed {
                    STATUS_COMPLETED
                } else {
                    STATUS_NEEDS_ACTION
                }
                .to_string(),
            ),
            due: task.due.map(wire_time),
            completed: if task.completed {
                task.completed_at.map(wire_time)
            } else {
                None
            },
            extra,
            ..Default::default()
        }))
    }
}
