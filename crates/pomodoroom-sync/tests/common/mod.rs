//! Shared fixtures: an in-memory Google Tasks stand-in.
//!
//! Shape translation is delegated to the real `GoogleTasksAdapter`, so only
//! the network half is faked.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use pomodoroom_sync::entity::{LocalTask, Pulled, PushReceipt, RemoteDraft};
use pomodoroom_sync::provider::tasks::remote_from_task;
use pomodoroom_sync::provider::wire::GoogleTask;
use pomodoroom_sync::provider::{GoogleClient, GoogleTasksAdapter, StaticTokenProvider};
use pomodoroom_sync::storage::LocalStore;
use pomodoroom_sync::sync::RetryPolicy;
use pomodoroom_sync::{
    EntityAdapter, EntityKind, LocalEntity, MappingStore, ProviderError, RemoteEntity,
    SyncConfig, SyncDb, SyncMapping, SyncOrchestrator, SyncScope,
};

pub const OWNER: &str = "owner-1";
pub const LIST: &str = "inbox";

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

fn wire_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn scope() -> SyncScope {
    SyncScope::TaskList {
        list_id: LIST.to_string(),
    }
}

pub fn local_task(id: &str, title: &str, updated_at: DateTime<Utc>) -> LocalEntity {
    LocalEntity::Task(LocalTask {
        id: id.to_string(),
        list_id: LIST.to_string(),
        title: title.to_string(),
        notes: None,
        due: None,
        completed: false,
        completed_at: None,
        updated_at,
        deleted_at: None,
        metadata: None,
    })
}

pub fn local_task_with_notes(
    id: &str,
    title: &str,
    notes: &str,
    updated_at: DateTime<Utc>,
) -> LocalEntity {
    match local_task(id, title, updated_at) {
        LocalEntity::Task(t) => LocalEntity::Task(LocalTask {
            notes: Some(notes.to_string()),
            ..t
        }),
        other => other,
    }
}

pub fn notes_of(entity: &LocalEntity) -> Option<&str> {
    match entity {
        LocalEntity::Task(t) => t.notes.as_deref(),
        LocalEntity::CalendarEvent(e) => e.description.as_deref(),
    }
}

pub fn title_of(entity: &LocalEntity) -> &str {
    match entity {
        LocalEntity::Task(t) => &t.title,
        LocalEntity::CalendarEvent(e) => &e.title,
    }
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<String, GoogleTask>,
    next_id: u32,
    next_etag: u32,
    fail_push: HashSet<String>,
    fail_pull: bool,
    pull_delay: Option<Duration>,
    pushes: u32,
    removes: u32,
}

impl State {
    fn etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"e{}\"", self.next_etag)
    }
}

pub struct FakeTasks {
    state: Mutex<State>,
    shapes: GoogleTasksAdapter,
}

impl FakeTasks {
    pub fn new() -> Arc<Self> {
        let client = GoogleClient::new(
            Arc::new(StaticTokenProvider::new("test")),
            Duration::from_secs(1),
        )
        .unwrap();
        Arc::new(Self {
            state: Mutex::new(State::default()),
            shapes: GoogleTasksAdapter::new(client, "http://127.0.0.1:9", 100),
        })
    }

    /// Insert a remote task directly, returning its etag.
    pub fn seed(&self, remote_id: &str, title: &str, updated: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        let etag = state.etag();
        state.tasks.insert(
            remote_id.to_string(),
            GoogleTask {
                id: Some(remote_id.to_string()),
                etag: Some(etag.clone()),
                title: Some(title.to_string()),
                status: Some("needsAction".to_string()),
                updated: Some(wire_time(updated)),
                ..Default::default()
            },
        );
        etag
    }

    /// A task the provider returns without an `updated` timestamp.
    pub fn seed_malformed(&self, remote_id: &str, title: &str) {
        let mut state = self.state.lock().unwrap();
        let etag = state.etag();
        state.tasks.insert(
            remote_id.to_string(),
            GoogleTask {
                id: Some(remote_id.to_string()),
                etag: Some(etag),
                title: Some(title.to_string()),
                status: Some("needsAction".to_string()),
                updated: None,
                ..Default::default()
            },
        );
    }

    /// Simulate an edit made on the provider side.
    pub fn edit(&self, remote_id: &str, title: &str, updated: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let etag = state.etag();
        let task = state.tasks.get_mut(remote_id).unwrap();
        task.title = Some(title.to_string());
        task.etag = Some(etag);
        task.updated = Some(wire_time(updated));
    }

    /// Simulate a deletion made on the provider side.
    pub fn delete_remotely(&self, remote_id: &str, updated: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let etag = state.etag();
        let task = state.tasks.get_mut(remote_id).unwrap();
        task.deleted = true;
        task.etag = Some(etag);
        task.updated = Some(wire_time(updated));
    }

    /// Drop a task entirely, so fetches return not-found.
    pub fn purge(&self, remote_id: &str) {
        self.state.lock().unwrap().tasks.remove(remote_id);
    }

    pub fn title(&self, remote_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(remote_id)
            .and_then(|t| t.title.clone())
    }

    pub fn notes(&self, remote_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(remote_id)
            .and_then(|t| t.notes.clone())
    }

    pub fn is_deleted(&self, remote_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(remote_id)
            .map(|t| t.deleted)
            .unwrap_or(true)
    }

    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| !t.deleted)
            .count()
    }

    pub fn fail_push_for(&self, local_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_push
            .insert(local_id.to_string());
    }

    pub fn fail_pull(&self) {
        self.state.lock().unwrap().fail_pull = true;
    }

    pub fn delay_pull(&self, delay: Duration) {
        self.state.lock().unwrap().pull_delay = Some(delay);
    }

    pub fn pushes(&self) -> u32 {
        self.state.lock().unwrap().pushes
    }

    pub fn removes(&self) -> u32 {
        self.state.lock().unwrap().removes
    }
}

#[async_trait]
impl EntityAdapter for FakeTasks {
    fn entity_kind(&self) -> EntityKind {
        EntityKind::Task
    }

    async fn pull(
        &self,
        _owner_id: &str,
        scope: &SyncScope,
    ) -> Result<Pulled, ProviderError> {
        let (delay, fail) = {
            let state = self.state.lock().unwrap();
            (state.pull_delay, state.fail_pull)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ProviderError::from_status(403, "insufficient permissions", None));
        }
        let tasks: Vec<GoogleTask> = self.state.lock().unwrap().tasks.values().cloned().collect();
        Ok(Pulled::from_results(tasks.into_iter().map(|t| {
            (t.id.clone(), remote_from_task(scope.target(), t))
        })))
    }

    async fn fetch(
        &self,
        _owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<Option<RemoteEntity>, ProviderError> {
        let task = self.state.lock().unwrap().tasks.get(remote_id).cloned();
        task.map(|t| remote_from_task(scope.target(), t)).transpose()
    }

    async fn push(
        &self,
        _owner_id: &str,
        local: &LocalEntity,
        remote_id: Option<&str>,
    ) -> Result<PushReceipt, ProviderError> {
        let RemoteDraft::Task(mut draft) = self.to_remote_shape(local)? else {
            return Err(ProviderError::permanent("not a task"));
        };
        let mut state = self.state.lock().unwrap();
        if state.fail_push.contains(local.id()) {
            return Err(ProviderError::from_status(400, "invalid task", None));
        }
        state.pushes += 1;

        let id = match remote_id {
            Some(id) if state.tasks.contains_key(id) => id.to_string(),
            Some(_) => return Err(ProviderError::from_status(404, "not found", None)),
            None => {
                state.next_id += 1;
                format!("r{}", state.next_id)
            }
        };
        let etag = state.etag();
        draft.id = Some(id.clone());
        draft.etag = Some(etag.clone());
        draft.updated = Some(wire_time(Utc::now()));
        state.tasks.insert(id.clone(), draft);

        Ok(PushReceipt {
            remote_id: id,
            version: etag,
        })
    }

    async fn remove(
        &self,
        _owner_id: &str,
        _scope: &SyncScope,
        remote_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.removes += 1;
        state.tasks.remove(remote_id);
        Ok(())
    }

    fn to_local_shape(&self, remote: &RemoteEntity) -> Result<LocalEntity, ProviderError> {
        self.shapes.to_local_shape(remote)
    }

    fn to_remote_shape(
        &self,
        local: &LocalEntity,
    ) -> Result<pomodoroom_sync::entity::RemoteDraft, ProviderError> {
        self.shapes.to_remote_shape(local)
    }
}

pub struct Harness {
    pub db: SyncDb,
    pub fake: Arc<FakeTasks>,
    pub orchestrator: SyncOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let db = SyncDb::open_memory().unwrap();
        let fake = FakeTasks::new();
        let orchestrator = SyncOrchestrator::new(db.clone(), &SyncConfig::default())
            .with_adapter(fake.clone())
            .with_retry_policy(RetryPolicy::none());
        Self {
            db,
            fake,
            orchestrator,
        }
    }

    pub fn put_local(&self, entity: &LocalEntity) {
        self.db.local_entities().upsert(OWNER, entity).unwrap();
    }

    pub fn get_local(&self, id: &str) -> Option<LocalEntity> {
        self.db
            .local_entities()
            .get(OWNER, EntityKind::Task, id)
            .unwrap()
    }

    pub fn mappings(&self) -> Vec<SyncMapping> {
        self.db.mappings().list(OWNER, EntityKind::Task).unwrap()
    }

    /// A local and remote task already in sync as of `synced_at`.
    pub fn seed_pair(&self, local_id: &str, remote_id: &str, title: &str, synced_at: DateTime<Utc>) {
        let local = local_task(local_id, title, synced_at);
        self.put_local(&local);
        let etag = self.fake.seed(remote_id, title, synced_at);
        self.db
            .mappings()
            .upsert(&SyncMapping {
                owner_id: OWNER.to_string(),
                entity_kind: EntityKind::Task,
                local_id: local_id.to_string(),
                remote_id: remote_id.to_string(),
                last_synced_at: synced_at,
                last_local_version: local.version(),
                last_remote_version: etag,
                metadata: None,
            })
            .unwrap();
    }
}
