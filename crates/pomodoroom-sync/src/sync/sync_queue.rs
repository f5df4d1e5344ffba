//! In-process queue of sync requests with per-scope coalescing.
//!
//! Webhook notifications arrive in bursts; a scope already waiting in the
//! queue is not enqueued twice. The key is cleared when the dispatcher picks
//! the request up, so a notification arriving mid-run schedules one more run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::orchestrator::SyncOrchestrator;
use crate::types::{EntityKind, SyncRequest};

/// `(owner_id, entity_kind, target)`.
type ScopeKey = (String, EntityKind, String);

fn scope_key(request: &SyncRequest) -> ScopeKey {
    (
        request.owner_id.clone(),
        request.entity_kind(),
        request.scope.target().to_string(),
    )
}

/// Result of [`SyncQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// A request for the same scope is already waiting.
    AlreadyPending,
    /// Queue at capacity.
    Full,
    /// Dispatcher has stopped.
    Closed,
}

/// Producer half. Cloning shares the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncRequest>,
    pending: Arc<Mutex<HashSet<ScopeKey>>>,
}

/// Consumer half, handed to [`spawn_dispatcher`].
pub struct SyncQueueReceiver {
    rx: mpsc::Receiver<SyncRequest>,
    pending: Arc<Mutex<HashSet<ScopeKey>>>,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> (Self, SyncQueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            SyncQueueReceiver { rx, pending },
        )
    }

    pub fn enqueue(&self, request: SyncRequest) -> EnqueueResult {
        let key = scope_key(&request);
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.contains(&key) {
            return EnqueueResult::AlreadyPending;
        }
        match self.tx.try_send(request) {
            Ok(()) => {
                pending.insert(key);
                EnqueueResult::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueResult::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueResult::Closed,
        }
    }

    /// Whether a request for this scope is waiting.
    pub fn is_pending(&self, request: &SyncRequest) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains(&scope_key(request)))
            .unwrap_or(false)
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SyncQueueReceiver {
    /// Next request, clearing its pending key. `None` once every producer is dropped.
    pub async fn recv(&mut self) -> Option<SyncRequest> {
        let request = self.rx.recv().await?;
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.remove(&scope_key(&request));
        Some(request)
    }
}

/// Pause between attempts while another run holds the scope's lease.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Drain the queue, running each request to completion in arrival order.
pub fn spawn_dispatcher(
    queue: SyncQueueReceiver,
    orchestrator: Arc<SyncOrchestrator>,
) -> JoinHandle<()> {
    spawn_dispatcher_with_retry(queue, orchestrator, BUSY_RETRY_DELAY)
}

/// Like [`spawn_dispatcher`], waiting `retry_delay` between attempts on a
/// busy scope. Gives up once a full lease TTL has passed.
pub fn spawn_dispatcher_with_retry(
    mut queue: SyncQueueReceiver,
    orchestrator: Arc<SyncOrchestrator>,
    retry_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = queue.recv().await {
            run_until_free(&orchestrator, &request, retry_delay).await;
        }
        info!("sync dispatcher stopped");
    })
}

async fn run_until_free(
    orchestrator: &SyncOrchestrator,
    request: &SyncRequest,
    retry_delay: Duration,
) {
    let deadline = Instant::now() + orchestrator.lease_ttl();
    loop {
        match orchestrator.run(request).await {
            Ok(run) => {
                info!(
                    run_id = %run.run_id,
                    owner_id = %request.owner_id,
                    status = run.status.as_str(),
                    "queued sync finished"
                );
                return;
            }
            Err(e) if e.is_already_running() => {
                if Instant::now() + retry_delay > deadline {
                    warn!(
                        owner_id = %request.owner_id,
                        entity_kind = %request.entity_kind(),
                        "queued sync dropped, scope busy for a full lease"
                    );
                    return;
                }
                debug!(
                    owner_id = %request.owner_id,
                    entity_kind = %request.entity_kind(),
                    "scope busy, retrying queued sync"
                );
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => {
                warn!(owner_id = %request.owner_id, error = %e, "queued sync failed");
                return;
            }
        }
    }
}
