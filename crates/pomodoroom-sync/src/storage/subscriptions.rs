//! Webhook channel subscriptions and delivery de-duplication.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{decode_ts, encode_ts, SyncDb};
use crate::error::StorageError;
use crate::types::EntityKind;

/// A registered push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub channel_id: String,
    pub resource_id: String,
    pub owner_id: String,
    pub entity_kind: EntityKind,
    /// Calendar id or task list id.
    pub target: String,
    /// Verification token echoed back by the provider.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub trait SubscriptionStore: Send + Sync {
    fn save(&self, subscription: &WebhookSubscription) -> Result<(), StorageError>;

    fn get(&self, channel_id: &str) -> Result<Option<WebhookSubscription>, StorageError>;

    fn remove(&self, channel_id: &str) -> Result<bool, StorageError>;

    /// Subscriptions expiring before `before`, soonest first.
    fn list_expiring(&self, before: DateTime<Utc>)
        -> Result<Vec<WebhookSubscription>, StorageError>;

    /// Record a delivery. Returns `false` if `(channel_id, message_number)` was seen before.
    fn record_delivery(
        &self,
        channel_id: &str,
        message_number: u64,
        resource_state: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Undo [`record_delivery`](Self::record_delivery) so a redelivery is processed.
    fn forget_delivery(&self, channel_id: &str, message_number: u64) -> Result<bool, StorageError>;

    /// Drop delivery records older than `before`.
    fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<usize, StorageError>;
}

#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    db: SyncDb,
}

impl SqliteSubscriptionStore {
    pub fn new(db: SyncDb) -> Self {
        Self { db }
    }
}

type RawSubscription = (String, String, String, String, String, String, String);

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawSubscription> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode(raw: RawSubscription) -> Result<WebhookSubscription, StorageError> {
    let (channel_id, resource_id, owner_id, kind, target, token, expires_at) = raw;
    Ok(WebhookSubscription {
        entity_kind: kind.parse().map_err(|message| StorageError::Corrupt {
            table: "webhook_subscriptions",
            message,
        })?,
        expires_at: decode_ts("webhook_subscriptions", &expires_at)?,
        channel_id,
        resource_id,
        owner_id,
        target,
        token,
    })
}

impl SubscriptionStore for SqliteSubscriptionStore {
    fn save(&self, subscription: &WebhookSubscription) -> Result<(), StorageError> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO webhook_subscriptions
                (channel_id, resource_id, owner_id, entity_kind, target, token, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(channel_id) DO UPDATE SET
                resource_id = excluded.resource_id,
                owner_id = excluded.owner_id,
                entity_kind = excluded.entity_kind,
                target = excluded.target,
                token = excluded.token,
                expires_at = excluded.expires_at",
            params![
                subscription.channel_id,
                subscription.resource_id,
                subscription.owner_id,
                subscription.entity_kind.as_str(),
                subscription.target,
                subscription.token,
                encode_ts(subscription.expires_at),
                encode_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn get(&self, channel_id: &str) -> Result<Option<WebhookSubscription>, StorageError> {
        let conn = self.db.lock()?;
        let raw = conn
            .query_row(
                "SELECT channel_id, resource_id, owner_id, entity_kind, target, token, expires_at
                 FROM webhook_subscriptions WHERE channel_id = ?1",
                [channel_id],
                raw_from_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    fn remove(&self, channel_id: &str) -> Result<bool, StorageError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM webhook_subscriptions WHERE channel_id = ?1",
            [channel_id],
        )?;
        Ok(removed > 0)
    }

    fn list_expiring(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<WebhookSubscription>, StorageError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT channel_id, resource_id, owner_id, entity_kind, target, token, expires_at
             FROM webhook_subscriptions WHERE expires_at < ?1
             ORDER BY expires_at",
        )?;
        let raws = stmt
            .query_map([encode_ts(before)], raw_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(decode).collect()
    }

    fn record_delivery(
        &self,
        channel_id: &str,
        message_number: u64,
        resource_state: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let message_number = i64::try_from(message_number).map_err(|_| {
            StorageError::QueryFailed(format!("message number {message_number} out of range"))
        })?;
        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO webhook_deliveries
                (channel_id, message_number, resource_state, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, message_number, resource_state, encode_ts(received_at)],
        )?;
        Ok(inserted == 1)
    }

    fn forget_delivery(&self, channel_id: &str, message_number: u64) -> Result<bool, StorageError> {
        let Ok(message_number) = i64::try_from(message_number) else {
            return Ok(false);
        };
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM webhook_deliveries WHERE channel_id = ?1 AND message_number = ?2",
            params![channel_id, message_number],
        )?;
        Ok(removed > 0)
    }

    fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM webhook_deliveries WHERE received_at < ?1",
            [encode_ts(before)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn subscription(channel: &str, expires_at: DateTime<Utc>) -> WebhookSubscription {
        WebhookSubscription {
            channel_id: channel.to_string(),
            resource_id: format!("res-{channel}"),
            owner_id: "o1".to_string(),
            entity_kind: EntityKind::CalendarEvent,
            target: "primary".to_string(),
            token: "tok".to_string(),
            expires_at,
        }
    }

    #[test]
    fn save_get_remove() {
        let store = SyncDb::open_memory().unwrap().subscriptions();
        let sub = subscription("ch-1", at(12));
        store.save(&sub).unwrap();
        assert_eq!(store.get("ch-1").unwrap(), Some(sub));
        assert!(store.remove("ch-1").unwrap());
        assert!(store.get("ch-1").unwrap().is_none());
    }

    #[test]
    fn list_expiring_orders_by_expiry() {
        let store = SyncDb::open_memory().unwrap().subscriptions();
        store.save(&subscription("later", at(11))).unwrap();
        store.save(&subscription("sooner", at(10))).unwrap();
        store.save(&subscription("far", at(20))).unwrap();

        let expiring = store.list_expiring(at(12)).unwrap();
        let ids: Vec<&str> = expiring.iter().map(|s| s.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["sooner", "later"]);
        assert!(expiring[0].is_expired(at(10)));
        assert!(!expiring[0].is_expired(at(10) - Duration::seconds(1)));
    }

    #[test]
    fn duplicate_delivery_is_detected() {
        let store = SyncDb::open_memory().unwrap().subscriptions();
        assert!(store.record_delivery("ch-1", 7, "exists", at(9)).unwrap());
        assert!(!store.record_delivery("ch-1", 7, "exists", at(9)).unwrap());
        assert!(store.record_delivery("ch-1", 8, "exists", at(9)).unwrap());
        assert!(store.record_delivery("ch-2", 7, "exists", at(9)).unwrap());

        assert!(store.forget_delivery("ch-1", 8).unwrap());
        assert!(store.record_delivery("ch-1", 8, "exists", at(9)).unwrap());

        assert_eq!(store.prune_deliveries(at(10)).unwrap(), 3);
        assert!(store.record_delivery("ch-1", 7, "exists", at(11)).unwrap());
    }
}
