//! Calendar adapter: local timeline events ⇄ Google Calendar events.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use reqwest::Method;
use tracing::warn;

use super::client::{endpoint, GoogleClient};
use super::wire::{EventDateTime, GoogleEvent, WatchChannel, WatchRequest};
use super::{parse_rfc3339, remote_version};
use crate::config::ProviderConfig;
use crate::entity::{
    CalendarEventMetadata, LocalEntity, LocalEvent, ProviderMetadata, Pulled, PushReceipt,
    RemoteDraft, RemoteEntity, RemotePayload,
};
use crate::error::ProviderError;
use crate::storage::WebhookSubscription;
use crate::sync::adapter::EntityAdapter;
use crate::types::{EntityKind, SyncScope};

/// Google's default channel lifetime when the response omits `expiration`.
const DEFAULT_CHANNEL_TTL_DAYS: i64 = 7;

pub struct GoogleCalendarAdapter {
    client: GoogleClient,
    base_url: String,
    page_size: u32,
}

impl GoogleCalendarAdapter {
    pub fn new(client: GoogleClient, base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            page_size,
        }
    }

    pub fn from_config(client: GoogleClient, cfg: &ProviderConfig) -> Self {
        Self::new(client, cfg.calendar_api_base.clone(), cfg.calendar_page_size)
    }

    fn events_url(&self, calendar_id: &str) -> String {
        endpoint(&self.base_url, &["calendars", calendar_id, "events"])
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        endpoint(&self.base_url, &["calendars", calendar_id, "events", event_id])
    }

    fn calendar_of(scope: &SyncScope) -> Result<&str, ProviderError> {
        match scope {
            SyncScope::TimeWindow { calendar_id, .. } => Ok(calendar_id),
            other => Err(ProviderError::permanent(format!(
                "calendar adapter cannot handle scope {other}"
            ))),
        }
    }

    /// Register a push channel on `calendar_id`'s events.
    pub async fn watch(
        &self,
        owner_id: &str,
        calendar_id: &str,
        channel_id: &str,
        address: &str,
        token: &str,
    ) -> Result<WebhookSubscription, ProviderError> {
        let url = endpoint(&self.base_url, &["calendars", calendar_id, "events", "watch"]);
        let request = WatchRequest {
            id: channel_id.to_string(),
            kind: "web_hook".to_string(),
            address: address.to_string(),
            token: token.to_string(),
        };
        let channel: WatchChannel = self
            .client
            .send_json(owner_id, Method::POST, &url, &request)
            .await?;

        let expires_at = channel
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc::now() + Duration::days(DEFAULT_CHANNEL_TTL_DAYS));

        Ok(WebhookSubscription {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            owner_id: owner_id.to_string(),
            entity_kind: EntityKind::CalendarEvent,
            target: calendar_id.to_string(),
            token: token.to_string(),
            expires_at,
        })
    }
}

/// Wrap a wire event as a [`RemoteEntity`].
pub fn remote_from_event(calendar_id: &str, event: GoogleEvent) -> Result<RemoteEntity, ProviderError> {
    let remote_id = event
        .id
        .clone()
        .ok_or_else(|| ProviderError::permanent("calendar event without id"))?;
    let updated = event
        .updated
        .as_deref()
        .ok_or_else(|| ProviderError::permanent(format!("event {remote_id} has no updated time")))?;
    let updated_at = parse_rfc3339("updated", updated)?;

    Ok(RemoteEntity {
        version: remote_version(event.etag.as_deref(), event.updated.as_deref()),
        container_id: calendar_id.to_string(),
        updated_at,
        deleted: event.is_cancelled(),
        remote_id,
        payload: RemotePayload::CalendarEvent(event),
    })
}

fn parse_event_time(field: &str, value: &EventDateTime) -> Result<(DateTime<Utc>, bool), ProviderError> {
    if let Some(dt) = value.date_time.as_deref() {
        return Ok((parse_rfc3339(field, dt)?, false));
    }
    if let Some(date) = value.date.as_deref() {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| ProviderError::permanent(format!("invalid {field} date '{date}': {e}")))?;
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ProviderError::permanent(format!("invalid {field} date '{date}'")))?;
        return Ok((Utc.from_utc_datetime(&midnight), true));
    }
    Err(ProviderError::permanent(format!("event {field} has neither dateTime nor date")))
}

fn event_time(at: DateTime<Utc>, all_day: bool, time_zone: Option<String>) -> EventDateTime {
    if all_day {
        EventDateTime {
            date_time: None,
            date: Some(at.date_naive().format("%Y-%m-%d").to_string()),
            time_zone,
        }
    } else {
        EventDateTime {
            date_time: Some(at.to_rfc3339()),
            date: None,
            time_zone,
        }
    }
}

fn empty_to_none(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

#[async_trait]
impl EntityAdapter for GoogleCalendarAdapter {
    fn entity_kind(&self) -> EntityKind {
        EntityKind::CalendarEvent
    }

    async fn pull(
        &self,
        owner_id: &str,
        scope: &SyncScope,
    ) -> Result<Pulled, ProviderError> {
        let SyncScope::TimeWindow {
            calendar_id,
            start,
            end,
        } = scope
        else {
            return Err(ProviderError::permanent(format!(
                "calendar adapter cannot handle scope {scope}"
            )));
        };

        let query = [
            ("timeMin", start.to_rfc3339()),
            ("timeMax", end.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("showDeleted", "true".to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        let events: Vec<GoogleEvent> = self
            .client
            .list_all(owner_id, &self.events_url(calendar_id), &query)
            .await?;

        let pulled = Pulled::from_results(
            events
                .into_iter()
                .map(|event| (event.id.clone(), remote_from_event(calendar_id, event))),
        );
        if !pulled.rejected.is_empty() {
            warn!(owner_id, calendar_id = %calendar_id, rejected = pulled.rejected.len(), "malformed events in pull");
        }
        Ok(pulled)
    }

    async fn fetch(
        &self,
        owner_id: &str,
        scope: &SyncScope,
        remote_id: &str,
    ) -> Result<Option<RemoteEntity>, ProviderError> {
        let calendar_id = Self::calendar_of(scope)?;
        let event: Option<GoogleEvent> = self
            .client
            .get_optional(owner_id, &self.event_url(calendar_id, remote_id))
            .await?;
        event.map(|e| remote_from_event(calendar_id, e)).transpose()
    }

    async fn push(
        &self,
        owner_id: &str,
        local: &LocalEntity,
        remote_id: Option<&str>,
    ) -> Result<PushReceipt, ProviderError> {
        let RemoteDraft::CalendarEvent(draft) = self.to_remote_shape(local)? else {
            return Err(ProviderError::permanent("calendar adapter produced a non-event draft"));
        };
        let calendar_id = local.container_id();

        let saved: GoogleEvent = match remote_id {
            Some(id) => {
                self.client
                    .send_json(owner_id, Method::PUT, &self.event_url(calendar_id, id), &draft)
                    .await?
            }
            None => {
                self.client
                    .send_json(owner_id, Method::POST, &self.events_url(calendar_id), &draft)
                    .await?
            }
        };

        let remote_id = saved
            .id
            .clone()
            .ok_or_else(|| ProviderError::permanent("provider response without event id"))?;
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
        let calendar_id = Self::calendar_of(scope)?;
        self.client
            .delete(owner_id, &self.event_url(calendar_id, remote_id))
            .await
    }

    fn to_local_shape(&self, remote: &RemoteEntity) -> Result<LocalEntity, ProviderError> {
        let RemotePayload::CalendarEvent(event) = &remote.payload else {
            return Err(ProviderError::permanent(format!(
                "expected calendar event, got {}",
                remote.kind()
            )));
        };

        let start_raw = event
            .start
            .as_ref()
            .ok_or_else(|| ProviderError::permanent("event without start"))?;
        let end_raw = event
            .end
            .as_ref()
            .ok_or_else(|| ProviderError::permanent("event without end"))?;
        let (start, all_day) = parse_event_time("start", start_raw)?;
        let (end, _) = parse_event_time("end", end_raw)?;

        let metadata = CalendarEventMetadata {
            etag: event.etag.clone(),
            color_id: event.color_id.clone(),
            transparency: event.transparency.clone(),
            visibility: event.visibility.clone(),
            html_link: event.html_link.clone(),
            i_cal_uid: event.i_cal_uid.clone(),
            start_time_zone: start_raw.time_zone.clone(),
            end_time_zone: end_raw.time_zone.clone(),
            extra: event.extra.clone(),
        };

        Ok(LocalEntity::CalendarEvent(LocalEvent {
            id: String::new(),
            calendar_id: remote.container_id.clone(),
            title: event.summary.clone().unwrap_or_default(),
            description: empty_to_none(&event.description),
            location: empty_to_none(&event.location),
            start,
            end,
            all_day,
            updated_at: remote.updated_at,
            deleted_at: remote.deleted.then_some(remote.updated_at),
            metadata: Some(ProviderMetadata::CalendarEvent(metadata)),
        }))
    }

    fn to_remote_shape(&self, local: &LocalEntity) -> Result<RemoteDraft, ProviderError> {
        let LocalEntity::CalendarEvent(ev) = local else {
            return Err(ProviderError::permanent(format!(
                "expected calendar event, got {}",
                local.kind()
            )));
        };
        if ev.deleted_at.is_some() {
            return Err(ProviderError::permanent("cannot push a deleted event"));
        }
        if ev.end < ev.start {
            return Err(ProviderError::permanent(format!(
                "event {} ends before it starts",
                ev.id
            )));
        }

        let meta = match &ev.metadata {
            Some(ProviderMetadata::CalendarEvent(m)) => m.clone(),
            _ => CalendarEventMetadata::default(),
        };

        Ok(RemoteDraft::CalendarEvent(GoogleEvent {
            summary: Some(ev.title.clone()),
            description: ev.description.clone(),
            location: ev.location.clone(),
            start: Some(event_time(ev.start, ev.all_day, meta.start_time_zone)),
            end: Some(event_time(ev.end, ev.all_day, meta.end_time_zone)),
            color_id: meta.color_id,
            transparency: meta.transparency,
            visibility: meta.visibility,
            extra: meta.extra,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::client::StaticTokenProvider;
    use std::sync::Arc;

    fn adapter() -> GoogleCalendarAdapter {
        let client = GoogleClient::new(
            Arc::new(StaticTokenProvider::new("t")),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        GoogleCalendarAdapter::new(client, "http://localhost", 250)
    }

    fn wire_event() -> GoogleEvent {
        serde_json::from_value(serde_json::json!({
            "id": "ev1",
            "etag": "\"e1\"",
            "status": "confirmed",
            "summary": "Deep work",
            "description": "",
            "start": {"dateTime": "2024-01-01T09:00:00Z", "timeZone": "Europe/Berlin"},
            "end": {"dateTime": "2024-01-01T10:00:00Z", "timeZone": "Europe/Berlin"},
            "updated": "2024-01-01T08:00:00.000Z",
            "colorId": "5",
            "htmlLink": "https://calendar.google.com/event?eid=x",
            "attendees": [{"email": "a@example.com"}]
        }))
        .unwrap()
    }

    #[test]
    fn remote_from_event_prefers_etag() {
        let remote = remote_from_event("primary", wire_event()).unwrap();
        assert_eq!(remote.remote_id, "ev1");
        assert_eq!(remote.version, "\"e1\"");
        assert!(!remote.deleted);
    }

    #[test]
    fn cancelled_event_is_deleted() {
        let mut ev = wire_event();
        ev.status = Some("cancelled".to_string());
        ev.etag = None;
        let remote = remote_from_event("primary", ev).unwrap();
        assert!(remote.deleted);
        assert_eq!(remote.version, "2024-01-01T08:00:00.000Z");
    }

    #[test]
    fn translation_round_trips_provider_fields() {
        let adapter = adapter();
        let remote = remote_from_event("primary", wire_event()).unwrap();
        let local = adapter.to_local_shape(&remote).unwrap();

        match &local {
            LocalEntity::CalendarEvent(ev) => {
                assert_eq!(ev.title, "Deep work");
                assert_eq!(ev.description, None);
                assert_eq!(ev.calendar_id, "primary");
                assert!(!ev.all_day);
            }
            _ => panic!("expected event"),
        }

        let RemoteDraft::CalendarEvent(draft) = adapter.to_remote_shape(&local).unwrap() else {
            panic!("expected event draft");
        };
        assert_eq!(draft.color_id.as_deref(), Some("5"));
        assert_eq!(
            draft.start.as_ref().unwrap().time_zone.as_deref(),
            Some("Europe/Berlin")
        );
        assert!(draft.extra.contains_key("attendees"));
        // read-only fields are not sent back
        assert!(draft.html_link.is_none());
        assert!(draft.id.is_none());
    }

    #[test]
    fn all_day_events_use_dates() {
        let adapter = adapter();
        let mut ev = wire_event();
        ev.start = Some(EventDateTime {
            date: Some("2024-03-05".to_string()),
            ..Default::default()
        });
        ev.end = Some(EventDateTime {
            date: Some("2024-03-06".to_string()),
            ..Default::default()
        });
        let local = adapter
            .to_local_shape(&remote_from_event("primary", ev).unwrap())
            .unwrap();
        let RemoteDraft::CalendarEvent(draft) = adapter.to_remote_shape(&local).unwrap() else {
            panic!("expected event draft");
        };
        assert_eq!(draft.start.unwrap().date.as_deref(), Some("2024-03-05"));
        assert_eq!(draft.end.unwrap().date.as_deref(), Some("2024-03-06"));
    }

    #[test]
    fn rejects_task_entities() {
        let adapter = adapter();
        let task = LocalEntity::Task(crate::entity::LocalTask {
            id: "t1".to_string(),
            list_id: "l".to_string(),
            title: "x".to_string(),
            notes: None,
            due: None,
            completed: false,
            completed_at: None,
            updated_at: Utc::now(),
            deleted_at: None,
            metadata: None,
        });
        assert!(adapter.to_remote_shape(&task).is_err());
    }
}
