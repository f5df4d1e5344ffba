//! # Pomodoroom Sync
//!
//! Bidirectional synchronization between Pomodoroom's local tasks and
//! timeline events and Google Calendar / Google Tasks.
//!
//! ## Architecture
//!
//! - **Storage**: SQLite mappings, run log, leases, webhook subscriptions and
//!   a local entity table
//! - **Provider**: Google Calendar v3 and Tasks v1 adapters over a shared
//!   HTTP client
//! - **Sync**: conflict resolution, the run orchestrator, retry policy and the
//!   webhook listener with its queue
//!
//! ## Key Components
//!
//! - [`SyncOrchestrator`]: drives one sync run
//! - [`ConflictResolver`]: last-writer-wins with a clock-skew window
//! - [`MappingStore`]: local id ⇄ remote id relation
//! - [`WebhookListener`]: turns push notifications into queued runs
//! - [`SyncConfig`]: TOML configuration

pub mod config;
pub mod entity;
pub mod error;
pub mod provider;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::SyncConfig;
pub use entity::{
    EntityField, LocalEntity, LocalEvent, LocalTask, ProviderMetadata, RemoteEntity,
    VersionedEntity,
};
pub use error::{ConfigError, LoggerError, MappingError, ProviderError, StorageError, SyncError};
pub use storage::{LeaseStore, LocalStore, MappingStore, SubscriptionStore, SyncDb};
pub use sync::{
    ConflictResolver, Decision, EntityAdapter, SyncLogger, SyncOrchestrator, SyncQueue, SyncRun,
    WebhookListener,
};
pub use types::{Direction, EntityKind, RunStatus, SyncMapping, SyncRequest, SyncScope, Trigger};
