//! Entity adapter port.
//!
//! One adapter per entity kind. Network calls are async and classified into
//! transient and permanent failures; the shape translations are pure.

use async_trait::async_trait;

use crate::entity::{LocalEntity, Pulled, PushReceipt, RemoteDraft, RemoteEntity};
use crate::error::ProviderError;
use crate::types::{EntityKind, SyncScope};

#[async_trait]
pub trait EntityAdapter: Send + Sync {
    fn entity_kind(&self) -> EntityKind;

    /// Every remote entity in scope, deletions included. Pages are followed
    /// transparently. Items that fail to parse come back in `rejected`.
    async fn pull(&self, owner_id: &str, scope: &SyncScope) -> Result<Pulled, ProviderError>;

    /// One remote entity. Not-found is `Ok(None)`.
    async fn fetch(
        &self,
        owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<Option<RemoteEntity>, ProviderError>;

    /// Create when `remote_id` is `None`, update otherwise.
    async fn push(
        &self,
        owner_id: &str,
        local: &LocalEntity,
        remote_id: Option<&str>,
    ) -> Result<PushReceipt, ProviderError>;

    /// Delete remotely. Not-found counts as success.
    async fn remove(
        &self,
        owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<(), ProviderError>;

    fn to_local_shape(&self, remote: &RemoteEntity) -> Result<LocalEntity, ProviderError>;

    fn to_remote_shape(&self, local: &LocalEntity) -> Result<RemoteDraft, ProviderError>;
}
