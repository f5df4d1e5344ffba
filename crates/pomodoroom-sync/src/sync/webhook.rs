//! Inbound provider push notifications.
//!
//! Google posts an empty body; everything is in the `X-Goog-*` headers. A
//! notification only says "something changed on this resource", so it is
//! turned into a bounded `from_remote` run for the subscription's scope.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::sync_queue::{EnqueueResult, SyncQueue};
use crate::config::WebhookConfig;
use crate::error::StorageError;
use crate::storage::{LeaseStore, SubscriptionStore, WebhookSubscription};
use crate::types::{Direction, EntityKind, SyncRequest, SyncScope, Trigger};

pub const HEADER_CHANNEL_ID: &str = "X-Goog-Channel-ID";
pub const HEADER_RESOURCE_ID: &str = "X-Goog-Resource-ID";
pub const HEADER_RESOURCE_STATE: &str = "X-Goog-Resource-State";
pub const HEADER_MESSAGE_NUMBER: &str = "X-Goog-Message-Number";
pub const HEADER_CHANNEL_TOKEN: &str = "X-Goog-Channel-Token";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Channel handshake sent right after `watch`.
    Sync,
    Exists,
    NotExists,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Sync => "sync",
            ResourceState::Exists => "exists",
            ResourceState::NotExists => "not_exists",
        }
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(ResourceState::Sync),
            "exists" => Ok(ResourceState::Exists),
            "not_exists" => Ok(ResourceState::NotExists),
            other => Err(format!("unknown resource state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub channel_id: String,
    pub resource_id: String,
    pub resource_state: ResourceState,
    pub message_number: u64,
    pub token: Option<String>,
}

impl WebhookNotification {
    /// Build from request headers. `header` looks a name up case-insensitively.
    pub fn from_headers<'a>(
        header: impl Fn(&str) -> Option<&'a str>,
    ) -> Result<Self, WebhookRejection> {
        let required = |name: &str| {
            header(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| WebhookRejection::Malformed(format!("missing {name}")))
        };

        let resource_state = required(HEADER_RESOURCE_STATE)?
            .parse()
            .map_err(WebhookRejection::Malformed)?;
        let raw_number = required(HEADER_MESSAGE_NUMBER)?;
        let message_number = raw_number.parse().map_err(|_| {
            WebhookRejection::Malformed(format!("invalid {HEADER_MESSAGE_NUMBER} '{raw_number}'"))
        })?;

        Ok(Self {
            channel_id: required(HEADER_CHANNEL_ID)?.to_string(),
            resource_id: required(HEADER_RESOURCE_ID)?.to_string(),
            resource_state,
            message_number,
            token: header(HEADER_CHANNEL_TOKEN).map(|t| t.trim().to_string()),
        })
    }
}

/// Accepted notification. All map to 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// `sync` handshake.
    Acknowledged,
    /// Replayed message, or the scope is already queued.
    Deduplicated,
    /// A run holds the lease; the request was queued behind it.
    AlreadyRunning(SyncRequest),
    Enqueued(SyncRequest),
}

#[derive(Error, Debug)]
pub enum WebhookRejection {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("channel token mismatch for '{0}'")]
    TokenMismatch(String),

    #[error("subscription for channel '{0}' has expired")]
    Expired(String),

    #[error("malformed notification: {0}")]
    Malformed(String),

    /// Sync queue full or stopped; the provider will redeliver.
    #[error("sync queue unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WebhookRejection {
    /// HTTP status returned to the provider.
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookRejection::UnknownChannel(_) | WebhookRejection::TokenMismatch(_) => 404,
            WebhookRejection::Expired(_) => 410,
            WebhookRejection::Malformed(_) => 400,
            WebhookRejection::Unavailable(_) | WebhookRejection::Storage(_) => 503,
        }
    }
}

/// Hex HMAC-SHA256 of the channel id, sent as the channel token on `watch`.
pub fn channel_token(secret: &str, channel_id: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(channel_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_token(secret: &str, subscription: &WebhookSubscription, presented: Option<&str>) -> bool {
    if secret.is_empty() {
        return subscription.token.is_empty() || presented == Some(subscription.token.as_str());
    }
    let Some(bytes) = presented.and_then(|t| hex::decode(t).ok()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(subscription.channel_id.as_bytes());
    mac.verify_slice(&bytes).is_ok()
}

pub struct WebhookListener {
    subscriptions: Arc<dyn SubscriptionStore>,
    leases: Arc<dyn LeaseStore>,
    queue: SyncQueue,
    secret: String,
    lookback: Duration,
    lookahead: Duration,
}

impl WebhookListener {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        leases: Arc<dyn LeaseStore>,
        queue: SyncQueue,
        config: &WebhookConfig,
    ) -> Self {
        Self {
            subscriptions,
            leases,
            queue,
            secret: config.channel_secret.clone(),
            lookback: Duration::hours(i64::from(config.lookback_hours)),
            lookahead: Duration::days(i64::from(config.lookahead_days)),
        }
    }

    pub fn handle(
        &self,
        notification: &WebhookNotification,
    ) -> Result<WebhookOutcome, WebhookRejection> {
        self.handle_at(notification, Utc::now())
    }

    pub fn handle_at(
        &self,
        notification: &WebhookNotification,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookRejection> {
        let channel_id = notification.channel_id.as_str();
        let subscription = self
            .subscriptions
            .get(channel_id)?
            .filter(|s| s.resource_id == notification.resource_id)
            .ok_or_else(|| {
                warn!(channel_id, resource_id = %notification.resource_id, "notification for unknown channel");
                WebhookRejection::UnknownChannel(channel_id.to_string())
            })?;

        if !verify_token(&self.secret, &subscription, notification.token.as_deref()) {
            warn!(channel_id, owner_id = %subscription.owner_id, "channel token mismatch");
            return Err(WebhookRejection::TokenMismatch(channel_id.to_string()));
        }
        if subscription.is_expired(now) {
            return Err(WebhookRejection::Expired(channel_id.to_string()));
        }
        if notification.resource_state == ResourceState::Sync {
            debug!(channel_id, "channel handshake");
            return Ok(WebhookOutcome::Acknowledged);
        }

        let fresh = self.subscriptions.record_delivery(
            channel_id,
            notification.message_number,
            notification.resource_state.as_str(),
            now,
        )?;
        if !fresh {
            debug!(channel_id, message_number = notification.message_number, "replayed notification");
            return Ok(WebhookOutcome::Deduplicated);
        }

        let request = self.request_for(&subscription, now);
        // a running sync may have pulled before this change, so a follow-up is queued either way
        let busy = self
            .leases
            .is_held(&request.owner_id, request.entity_kind(), now)?;

        match self.queue.enqueue(request.clone()) {
            EnqueueResult::Queued => {
                info!(
                    channel_id,
                    owner_id = %request.owner_id,
                    entity_kind = %request.entity_kind(),
                    busy,
                    "webhook sync enqueued"
                );
                if busy {
                    Ok(WebhookOutcome::AlreadyRunning(request))
                } else {
                    Ok(WebhookOutcome::Enqueued(request))
                }
            }
            EnqueueResult::AlreadyPending => Ok(WebhookOutcome::Deduplicated),
            EnqueueResult::Full | EnqueueResult::Closed => {
                self.subscriptions
                    .forget_delivery(channel_id, notification.message_number)?;
                Err(WebhookRejection::Unavailable(format!(
                    "cannot queue sync for {}",
                    request.scope
                )))
            }
        }
    }

    /// Bounded `from_remote` request covering the subscription's resource.
    pub fn request_for(&self, subscription: &WebhookSubscription, now: DateTime<Utc>) -> SyncRequest {
        let scope = match subscription.entity_kind {
            EntityKind::CalendarEvent => SyncScope::TimeWindow {
                calendar_id: subscription.target.clone(),
                start: now - self.lookback,
                end: now + self.lookahead,
            },
            EntityKind::Task => SyncScope::TaskList {
                list_id: subscription.target.clone(),
            },
        };
        SyncRequest {
            owner_id: subscription.owner_id.clone(),
            direction: Direction::FromRemote,
            scope,
            trigger: Trigger::Webhook,
        }
    }
}
