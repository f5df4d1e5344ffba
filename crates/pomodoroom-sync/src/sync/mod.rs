//! Sync engine: adapters, conflict resolution, orchestration and webhooks.
//!
//! A run takes the scope lease, pulls and/or pushes through an
//! [`EntityAdapter`], resolves each changed pair with the [`ConflictResolver`]
//! and records everything on a [`SyncLogger`] run row.

pub mod adapter;
pub mod conflict_resolver;
pub mod logger;
pub mod orchestrator;
pub mod retry;
pub mod sync_queue;
pub mod webhook;

#[cfg(test)]
mod conflict_resolver_tests;

pub use adapter::EntityAdapter;
pub use conflict_resolver::{ConflictResolver, Decision};
pub use logger::{ItemError, ItemOutcome, SyncLogger, SyncRun, SyncRunSummary, RUN_REF};
pub use orchestrator::SyncOrchestrator;
pub use retry::RetryPolicy;
pub use sync_queue::{
    spawn_dispatcher, spawn_dispatcher_with_retry, EnqueueResult, SyncQueue, SyncQueueReceiver,
    BUSY_RETRY_DELAY,
};
pub use webhook::{
    channel_token, ResourceState, WebhookListener, WebhookNotification, WebhookOutcome,
    WebhookRejection,
};
