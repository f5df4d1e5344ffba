//! Sync orchestrator: drives one run from lease to summary.
//!
//! Order of operations for a run:
//! 1. take the `(owner, kind)` lease (refusal means no run row is written)
//! 2. open the run log
//! 3. collect candidates from the local store and/or the provider
//! 4. resolve and apply each candidate, recording item outcomes
//! 5. close the run and release the lease
//!
//! Item failures are recorded and the run continues. Storage failures and a
//! failed pull end the run as `failed`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::EntityAdapter;
use super::conflict_resolver::{ConflictResolver, Decision};
use super::logger::{ItemOutcome, SyncLogger, SyncRun, RUN_REF};
use super::retry::RetryPolicy;
use crate::config::SyncConfig;
use crate::entity::{LocalEntity, PushReceipt, RejectedItem, RemoteEntity, VersionedEntity};
use crate::error::{LoggerError, MappingError, ProviderError, StorageError, SyncError};
use crate::storage::{LeaseStore, LocalStore, MappingStore, SyncDb};
use crate::types::{entity_ref, EntityKind, RunStatus, SyncMapping, SyncRequest, SyncScope};

/// Why one candidate could not be synced.
enum ItemFailure {
    /// Recorded on the run; processing continues.
    Item(String),
    /// Ends the run.
    Fatal(SyncError),
}

impl From<ProviderError> for ItemFailure {
    fn from(err: ProviderError) -> Self {
        ItemFailure::Item(err.to_string())
    }
}

impl From<StorageError> for ItemFailure {
    fn from(err: StorageError) -> Self {
        ItemFailure::Fatal(SyncError::Storage(err))
    }
}

impl From<LoggerError> for ItemFailure {
    fn from(err: LoggerError) -> Self {
        ItemFailure::Fatal(SyncError::Logger(err))
    }
}

impl From<MappingError> for ItemFailure {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::Storage(e) => ItemFailure::Fatal(SyncError::Storage(e)),
            other => ItemFailure::Item(other.to_string()),
        }
    }
}

/// A mapped entity with whatever versions have been loaded so far.
struct Pair {
    mapping: SyncMapping,
    local: Option<LocalEntity>,
    remote: Option<RemoteEntity>,
}

enum Candidate {
    /// Local entity never synced.
    NewLocal(LocalEntity),
    /// Remote entity never synced.
    NewRemote(RemoteEntity),
    Mapped(Pair),
}

/// The other side of a mapped pair after loading.
enum RemoteSide {
    Live(RemoteEntity),
    Deleted(RemoteEntity),
    /// 404 on fetch; treated as deleted at the last sync time.
    Missing,
}

pub struct SyncOrchestrator {
    mappings: Arc<dyn MappingStore>,
    local: Arc<dyn LocalStore>,
    leases: Arc<dyn LeaseStore>,
    logger: SyncLogger,
    adapters: HashMap<EntityKind, Arc<dyn EntityAdapter>>,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    provider: String,
    max_duration: Duration,
    lease_ttl: chrono::Duration,
}

impl SyncOrchestrator {
    /// Wire the SQLite stores from `db` with settings from `config`.
    pub fn new(db: SyncDb, config: &SyncConfig) -> Self {
        Self {
            mappings: Arc::new(db.mappings()),
            local: Arc::new(db.local_entities()),
            leases: Arc::new(db.leases()),
            logger: SyncLogger::new(db),
            adapters: HashMap::new(),
            resolver: ConflictResolver::new(config.clock_skew_tolerance()),
            retry: RetryPolicy::from(&config.retry),
            provider: config.provider.name.clone(),
            max_duration: config.max_run_duration(),
            lease_ttl: chrono::Duration::from_std(config.lease_ttl())
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn EntityAdapter>) -> Self {
        self.adapters.insert(adapter.entity_kind(), adapter);
        self
    }

    pub fn with_mapping_store(mut self, store: Arc<dyn MappingStore>) -> Self {
        self.mappings = store;
        self
    }

    pub fn with_local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = store;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn logger(&self) -> &SyncLogger {
        &self.logger
    }

    /// How long a lease may be held before it is treated as stale.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl.to_std().unwrap_or_default()
    }

    pub fn leases(&self) -> &Arc<dyn LeaseStore> {
        &self.leases
    }

    /// Execute one run.
    ///
    /// Returns the finalized run for completed and failed runs alike.
    /// `AlreadyRunning` and storage failures are returned as errors.
    pub async fn run(&self, request: &SyncRequest) -> Result<SyncRun, SyncError> {
        let kind = request.entity_kind();
        let adapter = self
            .adapters
            .get(&kind)
            .cloned()
            .ok_or(SyncError::UnsupportedKind(kind))?;

        let holder = Uuid::new_v4().to_string();
        let acquired = self.leases.try_acquire(
            &request.owner_id,
            kind,
            &holder,
            Utc::now(),
            self.lease_ttl,
        )?;
        if !acquired {
            info!(owner_id = %request.owner_id, entity_kind = %kind, "sync already running");
            return Err(SyncError::AlreadyRunning {
                owner_id: request.owner_id.clone(),
                entity_kind: kind,
            });
        }

        let result = self.run_leased(request, adapter.as_ref()).await;

        match self.leases.release(&request.owner_id, kind, &holder) {
            Ok(true) => {}
            Ok(false) => warn!(owner_id = %request.owner_id, entity_kind = %kind, "lease expired before release"),
            Err(e) => warn!(owner_id = %request.owner_id, error = %e, "failed to release lease"),
        }
        result
    }

    async fn run_leased(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
    ) -> Result<SyncRun, SyncError> {
        let run = self.logger.start(
            &request.owner_id,
            &self.provider,
            request.trigger,
            request.direction,
            request.entity_kind(),
        )?;

        let outcome =
            tokio::time::timeout(self.max_duration, self.execute(&run, request, adapter)).await;

        let (status, fatal) = match outcome {
            Ok(Ok(())) => (RunStatus::Completed, None),
            Ok(Err(err @ SyncError::Storage(_))) | Ok(Err(err @ SyncError::Logger(_))) => {
                (RunStatus::Failed, Some(err))
            }
            Ok(Err(err)) => {
                self.note_run_error(&run.run_id, &err.to_string());
                (RunStatus::Failed, None)
            }
            Err(_) => {
                let err = SyncError::Timeout(self.max_duration);
                self.note_run_error(&run.run_id, &err.to_string());
                (RunStatus::Failed, None)
            }
        };

        if let Some(err) = fatal {
            self.note_run_error(&run.run_id, &err.to_string());
            if let Err(e) = self.logger.finish(&run.run_id, status) {
                warn!(run_id = %run.run_id, error = %e, "could not close failed run");
            }
            return Err(err);
        }

        Ok(self.logger.finish(&run.run_id, status)?)
    }

    fn note_run_error(&self, run_id: &str, message: &str) {
        if let Err(e) = self.logger.record_error(run_id, RUN_REF, message) {
            warn!(run_id, error = %e, "could not record run error");
        }
    }

    /// Close runs left `started` by a crashed process.
    pub fn abandon_expired(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.logger.abandon_expired(self.max_duration, Utc::now())?)
    }

    async fn execute(
        &self,
        run: &SyncRun,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
    ) -> Result<(), SyncError> {
        let (candidates, rejected) = self.collect_candidates(request, adapter).await?;
        debug!(run_id = %run.run_id, candidates = candidates.len(), "collected candidates");

        for item in rejected {
            let item_ref = entity_ref(
                request.entity_kind(),
                None,
                Some(item.remote_id.as_deref().unwrap_or("unknown")),
            );
            warn!(run_id = %run.run_id, entity_ref = %item_ref, error = %item.message, "malformed remote item");
            self.logger.record_error(&run.run_id, &item_ref, &item.message)?;
        }

        for candidate in candidates {
            let item_ref = candidate_ref(request.entity_kind(), &candidate);
            match self.process(request, adapter, candidate).await {
                Ok(Some(outcome)) => self.logger.record_item(&run.run_id, outcome)?,
                Ok(None) => {}
                Err(ItemFailure::Item(message)) => {
                    self.logger.record_error(&run.run_id, &item_ref, &message)?
                }
                Err(ItemFailure::Fatal(err)) => return Err(err),
            }
        }
        Ok(())
    }

    async fn collect_candidates(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
    ) -> Result<(Vec<Candidate>, Vec<RejectedItem>), SyncError> {
        let owner = request.owner_id.as_str();
        let kind = request.entity_kind();

        let mappings = self.mappings.list(owner, kind)?;
        let mut by_local: HashMap<String, SyncMapping> = HashMap::with_capacity(mappings.len());
        let mut local_by_remote: HashMap<String, String> = HashMap::with_capacity(mappings.len());
        for m in mappings {
            local_by_remote.insert(m.remote_id.clone(), m.local_id.clone());
            by_local.insert(m.local_id.clone(), m);
        }

        let mut new_locals = Vec::new();
        let mut new_remotes = Vec::new();
        let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
        let mut rejected = Vec::new();

        if request.direction.writes_remote() {
            for local in self.local.list_in_scope(owner, &request.scope)? {
                match by_local.get(local.id()) {
                    None if local.is_tombstone() => {}
                    None => new_locals.push(local),
                    Some(m) if local.version() == m.last_local_version => {}
                    Some(m) => {
                        pairs
                            .entry(m.local_id.clone())
                            .or_insert_with(|| Pair {
                                mapping: m.clone(),
                                local: None,
                                remote: None,
                            })
                            .local = Some(local);
                    }
                }
            }
        }

        if request.direction.writes_local() {
            let scope = &request.scope;
            let pulled = self
                .retry
                .run("pull", move || adapter.pull(owner, scope))
                .await?;
            rejected = pulled.rejected;
            for remote in pulled.entities {
                let mapped = local_by_remote
                    .get(&remote.remote_id)
                    .and_then(|local_id| by_local.get(local_id));
                match mapped {
                    None if remote.deleted => {}
                    None => new_remotes.push(remote),
                    Some(m) if remote.version == m.last_remote_version => {
                        // unchanged, but saves a fetch if the local side changed
                        if let Some(pair) = pairs.get_mut(&m.local_id) {
                            pair.remote = Some(remote);
                        }
                    }
                    Some(m) => {
                        pairs
                            .entry(m.local_id.clone())
                            .or_insert_with(|| Pair {
                                mapping: m.clone(),
                                local: None,
                                remote: None,
                            })
                            .remote = Some(remote);
                    }
                }
            }
        }

        let mut candidates: Vec<Candidate> = pairs.into_values().map(Candidate::Mapped).collect();
        candidates.extend(new_locals.into_iter().map(Candidate::NewLocal));
        candidates.extend(new_remotes.into_iter().map(Candidate::NewRemote));
        Ok((candidates, rejected))
    }

    async fn process(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        candidate: Candidate,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        match candidate {
            Candidate::NewLocal(local) => self.create_remote(request, adapter, local).await,
            Candidate::NewRemote(remote) => self.create_local(request, adapter, remote),
            Candidate::Mapped(pair) => self.reconcile(request, adapter, pair).await,
        }
    }

    async fn push(
        &self,
        adapter: &dyn EntityAdapter,
        owner: &str,
        local: &LocalEntity,
        remote_id: Option<&str>,
    ) -> Result<PushReceipt, ProviderError> {
        self.retry
            .run("push", move || adapter.push(owner, local, remote_id))
            .await
    }

    /// Local entity with no mapping: create it remotely, then record the mapping.
    async fn create_remote(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        local: LocalEntity,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        let owner = request.owner_id.as_str();
        let receipt = self.push(adapter, owner, &local, None).await?;

        let mapping = SyncMapping {
            owner_id: owner.to_string(),
            entity_kind: local.kind(),
            local_id: local.id().to_string(),
            remote_id: receipt.remote_id.clone(),
            last_synced_at: Utc::now(),
            last_local_version: local.version(),
            last_remote_version: receipt.version,
            metadata: local.metadata().cloned(),
        };
        if let Err(e) = self.mappings.compare_and_set(None, &mapping) {
            warn!(
                owner_id = owner,
                local_id = %mapping.local_id,
                remote_id = %receipt.remote_id,
                "remote entity created but mapping write failed"
            );
            return Err(e.into());
        }

        debug!(owner_id = owner, local_id = %mapping.local_id, remote_id = %mapping.remote_id, "created remote");
        Ok(Some(ItemOutcome::Created))
    }

    /// Remote entity with no mapping: create it locally, then record the mapping.
    fn create_local(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        remote: RemoteEntity,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        let owner = request.owner_id.as_str();
        let mut local = adapter.to_local_shape(&remote)?;
        local.set_id(Uuid::new_v4().to_string());

        let mapping = SyncMapping {
            owner_id: owner.to_string(),
            entity_kind: local.kind(),
            local_id: local.id().to_string(),
            remote_id: remote.remote_id.clone(),
            last_synced_at: Utc::now(),
            last_local_version: local.version(),
            last_remote_version: remote.version.clone(),
            metadata: local.metadata().cloned(),
        };
        self.mappings.compare_and_set(None, &mapping)?;
        self.local.upsert(owner, &local)?;

        debug!(owner_id = owner, local_id = %mapping.local_id, remote_id = %mapping.remote_id, "created local");
        Ok(Some(ItemOutcome::Created))
    }

    async fn load_remote(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        remote_id: &str,
    ) -> Result<RemoteSide, ProviderError> {
        let owner = request.owner_id.as_str();
        let scope: &SyncScope = &request.scope;
        let fetched = self
            .retry
            .run("fetch", move || adapter.fetch(owner, scope, remote_id))
            .await?;
        Ok(match fetched {
            Some(remote) if remote.deleted => RemoteSide::Deleted(remote),
            Some(remote) => RemoteSide::Live(remote),
            None => RemoteSide::Missing,
        })
    }

    /// Mapped pair: load what is missing, decide, apply in the allowed direction.
    async fn reconcile(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        pair: Pair,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        let owner = request.owner_id.as_str();
        let kind = request.entity_kind();
        let Pair {
            mapping,
            local,
            remote,
        } = pair;

        let local = match local {
            Some(l) => Some(l),
            None => self.local.get(owner, kind, &mapping.local_id)?,
        };
        let remote = match remote {
            Some(r) if r.deleted => RemoteSide::Deleted(r),
            Some(r) => RemoteSide::Live(r),
            None => self.load_remote(request, adapter, &mapping.remote_id).await?,
        };

        let local_changed = match &local {
            Some(l) => l.version() != mapping.last_local_version,
            None => true,
        };
        let remote_changed = match &remote {
            RemoteSide::Live(r) | RemoteSide::Deleted(r) => r.version != mapping.last_remote_version,
            RemoteSide::Missing => true,
        };

        let decision = match (local_changed, remote_changed) {
            (false, false) => return Ok(None),
            (true, false) => Decision::KeepLocal,
            (false, true) => Decision::KeepRemote,
            (true, true) => {
                let local_version = match &local {
                    Some(l) => VersionedEntity::from_local(l),
                    None => VersionedEntity::tombstone(mapping.last_synced_at),
                };
                let remote_version = match &remote {
                    RemoteSide::Live(r) => {
                        let translated = adapter.to_local_shape(r).ok();
                        VersionedEntity::from_remote(r, translated.as_ref())
                    }
                    RemoteSide::Deleted(r) => VersionedEntity::from_remote(r, None),
                    RemoteSide::Missing => VersionedEntity::tombstone(mapping.last_synced_at),
                };
                self.resolver.resolve(&local_version, &remote_version)
            }
        };

        debug!(
            owner_id = owner,
            entity_ref = %entity_ref(kind, Some(&mapping.local_id), Some(&mapping.remote_id)),
            local_changed,
            remote_changed,
            decision = ?decision,
            "resolved"
        );

        match decision {
            Decision::KeepLocal => self.apply_local_wins(request, adapter, mapping, local, remote).await,
            Decision::KeepRemote => self.apply_remote_wins(request, adapter, mapping, local, remote),
            Decision::Merge(fields) => {
                let (Some(local), RemoteSide::Live(remote)) = (local, remote) else {
                    return Err(ItemFailure::Item("merge requires two live versions".to_string()));
                };
                let mut merged = adapter.to_local_shape(&remote)?;
                merged.set_id(mapping.local_id.clone());
                merged.overlay_fields(&local, &fields);
                merged.touch(local.updated_at().max(remote.updated_at));
                self.apply_merge(request, adapter, mapping, local, merged, remote).await
            }
        }
    }

    async fn apply_local_wins(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        mapping: SyncMapping,
        local: Option<LocalEntity>,
        remote: RemoteSide,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        if !request.direction.writes_remote() {
            return Ok(None);
        }
        let owner = request.owner_id.as_str();

        let local = match local {
            Some(l) if !l.is_tombstone() => l,
            // local deletion wins: propagate it
            _ => {
                if !matches!(remote, RemoteSide::Missing) {
                    let scope = &request.scope;
                    let remote_id = mapping.remote_id.as_str();
                    self.retry
                        .run("remove", move || adapter.remove(owner, scope, remote_id))
                        .await?;
                }
                self.mappings
                    .delete(owner, mapping.entity_kind, &mapping.local_id)?;
                return Ok(Some(ItemOutcome::Deleted));
            }
        };

        let (receipt, outcome) = match remote {
            RemoteSide::Missing => (self.push(adapter, owner, &local, None).await?, ItemOutcome::Created),
            RemoteSide::Live(_) | RemoteSide::Deleted(_) => {
                match self
                    .push(adapter, owner, &local, Some(&mapping.remote_id))
                    .await
                {
                    Ok(receipt) => (receipt, ItemOutcome::Updated),
                    // gone between fetch and update: recreate
                    Err(e) if e.is_not_found() => {
                        (self.push(adapter, owner, &local, None).await?, ItemOutcome::Created)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let updated = SyncMapping {
            remote_id: receipt.remote_id,
            last_synced_at: Utc::now(),
            last_local_version: local.version(),
            last_remote_version: receipt.version,
            metadata: local.metadata().cloned().or_else(|| mapping.metadata.clone()),
            ..mapping.clone()
        };
        self.mappings
            .compare_and_set(Some(mapping.last_synced_at), &updated)?;
        Ok(Some(outcome))
    }

    fn apply_remote_wins(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        mapping: SyncMapping,
        local: Option<LocalEntity>,
        remote: RemoteSide,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        if !request.direction.writes_local() {
            return Ok(None);
        }
        let owner = request.owner_id.as_str();

        let deleted_at = match &remote {
            RemoteSide::Live(_) => None,
            RemoteSide::Deleted(r) => Some(r.updated_at),
            RemoteSide::Missing => Some(Utc::now()),
        };
        let remote = match (remote, deleted_at) {
            (RemoteSide::Live(r), _) => r,
            (_, deleted_at) => {
                let deleted_at = deleted_at.unwrap_or_else(Utc::now);
                let removed_locally = match &local {
                    Some(l) if !l.is_tombstone() => {
                        self.local
                            .mark_deleted(owner, mapping.entity_kind, &mapping.local_id, deleted_at)?
                    }
                    _ => false,
                };
                self.mappings
                    .delete(owner, mapping.entity_kind, &mapping.local_id)?;
                return Ok(removed_locally.then_some(ItemOutcome::Deleted));
            }
        };

        let mut incoming = adapter.to_local_shape(&remote)?;
        incoming.set_id(mapping.local_id.clone());

        let updated = SyncMapping {
            last_synced_at: Utc::now(),
            last_local_version: incoming.version(),
            last_remote_version: remote.version.clone(),
            metadata: incoming.metadata().cloned(),
            ..mapping.clone()
        };
        self.mappings
            .compare_and_set(Some(mapping.last_synced_at), &updated)?;
        self.local.upsert(owner, &incoming)?;

        Ok(Some(if local.as_ref().map(|l| l.is_tombstone()).unwrap_or(true) {
            ItemOutcome::Created
        } else {
            ItemOutcome::Updated
        }))
    }

    /// Write the merged entity to every side the direction allows.
    ///
    /// A side left unwritten keeps a version marker that no longer matches,
    /// so the next run that may write it sees a one-sided change and
    /// finishes the merge there.
    async fn apply_merge(
        &self,
        request: &SyncRequest,
        adapter: &dyn EntityAdapter,
        mapping: SyncMapping,
        local: LocalEntity,
        merged: LocalEntity,
        remote: RemoteEntity,
    ) -> Result<Option<ItemOutcome>, ItemFailure> {
        let owner = request.owner_id.as_str();
        let direction = request.direction;

        let last_remote_version = if direction.writes_remote() {
            let receipt = self
                .push(adapter, owner, &merged, Some(&mapping.remote_id))
                .await?;
            if direction.writes_local() {
                receipt.version
            } else {
                // local still holds the pre-merge copy; the next pull brings the merge back
                mapping.last_remote_version.clone()
            }
        } else {
            remote.version.clone()
        };

        let last_local_version = match (direction.writes_local(), direction.writes_remote()) {
            (true, true) => merged.version(),
            // remote still lacks the local-only fields; the next push sends them
            (true, false) => mapping.last_local_version.clone(),
            (false, _) => local.version(),
        };

        let updated = SyncMapping {
            last_synced_at: Utc::now(),
            last_local_version,
            last_remote_version,
            metadata: merged.metadata().cloned().or_else(|| mapping.metadata.clone()),
            ..mapping.clone()
        };
        self.mappings
            .compare_and_set(Some(mapping.last_synced_at), &updated)?;
        if direction.writes_local() {
            self.local.upsert(owner, &merged)?;
        }
        Ok(Some(ItemOutcome::Updated))
    }
}

fn candidate_ref(kind: EntityKind, candidate: &Candidate) -> String {
    match candidate {
        Candidate::NewLocal(local) => entity_ref(kind, Some(local.id()), None),
        Candidate::NewRemote(remote) => entity_ref(kind, None, Some(&remote.remote_id)),
        Candidate::Mapped(pair) => entity_ref(kind, Some(&pair.mapping.local_id), None),
    }
}
