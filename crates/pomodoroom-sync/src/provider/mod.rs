//! Google Calendar v3 and Google Tasks v1 adapters.

pub mod calendar;
pub mod client;
pub mod tasks;
pub mod wire;

pub use calendar::GoogleCalendarAdapter;
pub use client::{EnvTokenProvider, GoogleClient, StaticTokenProvider, TokenProvider};
pub use tasks::GoogleTasksAdapter;

use chrono::{DateTime, Utc};

use crate::error::ProviderError;

pub(crate) fn parse_rfc3339(field: &str, raw: &str) -> Result<DateTime<Utc>, ProviderError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProviderError::permanent(format!("invalid {field} '{raw}': {e}")))
}

/// Version marker: etag when present, else the `updated` timestamp.
pub(crate) fn remote_version(etag: Option<&str>, updated: Option<&str>) -> String {
    etag.or(updated).unwrap_or_default().to_string()
}
