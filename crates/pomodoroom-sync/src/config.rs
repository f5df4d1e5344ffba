//! TOML-based sync configuration.
//!
//! Stored at `~/.config/pomodoroom/sync.toml` (or `pomodoroom-dev` when
//! `POMODOROOM_ENV=dev`). Every section has defaults, so a partial file is
//! valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::data_dir;

/// Conflict resolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Timestamps closer than this are treated as simultaneous.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_tolerance_secs: u64,
}

/// Per-run limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
}

/// Scope lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Must exceed `run.max_duration_secs`.
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

/// Backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized in either direction, 0.0..=1.0.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Push notification handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: u32,
    /// HMAC key for channel tokens. Empty disables token issuance.
    #[serde(default)]
    pub channel_secret: String,
    /// Public URL the provider posts notifications to.
    #[serde(default)]
    pub callback_url: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Provider endpoints and paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_calendar_api_base")]
    pub calendar_api_base: String,
    #[serde(default = "default_tasks_api_base")]
    pub tasks_api_base: String,
    #[serde(default = "default_calendar_page_size")]
    pub calendar_page_size: u32,
    #[serde(default = "default_tasks_page_size")]
    pub tasks_page_size: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub access_token_env: String,
}

/// HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Root sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_clock_skew() -> u64 {
    2
}
fn default_max_duration() -> u64 {
    600
}
fn default_lease_ttl() -> u64 {
    900
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_lookahead_days() -> u32 {
    7
}
fn default_queue_capacity() -> usize {
    64
}
fn default_provider_name() -> String {
    "google".to_string()
}
fn default_calendar_api_base() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}
fn default_tasks_api_base() -> String {
    "https://tasks.googleapis.com/tasks/v1".to_string()
}
fn default_calendar_page_size() -> u32 {
    250
}
fn default_tasks_page_size() -> u32 {
    100
}
fn default_request_timeout() -> u64 {
    30
}
fn default_token_env() -> String {
    "POMODOROOM_GOOGLE_TOKEN".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_secs: default_clock_skew(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            lookahead_days: default_lookahead_days(),
            channel_secret: String::new(),
            callback_url: String::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            calendar_api_base: default_calendar_api_base(),
            tasks_api_base: default_tasks_api_base(),
            calendar_page_size: default_calendar_page_size(),
            tasks_page_size: default_tasks_page_size(),
            request_timeout_secs: default_request_timeout(),
            access_token_env: default_token_env(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict: ConflictConfig::default(),
            run: RunConfig::default(),
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            webhook: WebhookConfig::default(),
            provider: ProviderConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl SyncConfig {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let (parent_path, leaf) = match key.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, key),
        };
        if leaf.is_empty() {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }

        let parent = match parent_path {
            Some(path) => {
                let mut current = &mut *root;
                for part in path.split('.') {
                    current = current
                        .get_mut(part)
                        .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
                }
                current
            }
            None => root,
        };

        let obj = parent
            .as_object_mut()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let existing = obj
            .get(leaf)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        let new_value = match existing {
            serde_json::Value::Bool(_) => serde_json::Value::Bool(
                value
                    .parse::<bool>()
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            serde_json::Value::Number(_) => {
                if let Ok(n) = value.parse::<u64>() {
                    serde_json::Value::Number(n.into())
                } else if let Ok(n) = value.parse::<f64>() {
                    serde_json::Number::from_f64(n)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| invalid(format!("cannot parse '{value}' as number")))?
                } else {
                    return Err(invalid(format!("cannot parse '{value}' as number")));
                }
            }
            serde_json::Value::Object(_) => {
                return Err(ConfigError::UnknownKey(key.to_string()));
            }
            _ => serde_json::Value::String(value.into()),
        };

        obj.insert(leaf.to_string(), new_value);
        Ok(())
    }

    /// Default config file location.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("sync.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path`, writing defaults if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: SyncConfig =
                    toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by dot-separated key. Does not persist; call `save`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: SyncConfig =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.ttl_secs <= self.run.max_duration_secs {
            return Err(ConfigError::InvalidValue {
                key: "lease.ttl_secs".to_string(),
                message: format!(
                    "must exceed run.max_duration_secs ({})",
                    self.run.max_duration_secs
                ),
            });
        }
        if self.run.max_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.max_duration_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::InvalidValue {
                key: "retry.jitter".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.provider.calendar_page_size == 0 || self.provider.tasks_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "provider.page_size".to_string(),
                message: "page sizes must be positive".to_string(),
            });
        }
        if self.webhook.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "webhook.queue_capacity".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.conflict.clock_skew_tolerance_secs)
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.run.max_duration_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.conflict.clock_skew_tolerance_secs, 2);
        assert_eq!(parsed.webhook.lookback_hours, 24);
        assert_eq!(parsed.webhook.lookahead_days, 7);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: SyncConfig = toml::from_str("[run]\nmax_duration_secs = 120\n").unwrap();
        assert_eq!(cfg.run.max_duration_secs, 120);
        assert_eq!(cfg.lease.ttl_secs, 900);
        assert_eq!(cfg.provider.name, "google");
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.get("lease.ttl_secs").as_deref(), Some("900"));
        assert_eq!(cfg.get("server.bind").as_deref(), Some("127.0.0.1:8787"));
        assert!(cfg.get("server.missing").is_none());
    }

    #[test]
    fn set_updates_nested_number() {
        let mut cfg = SyncConfig::default();
        cfg.set("conflict.clock_skew_tolerance_secs", "5").unwrap();
        assert_eq!(cfg.conflict.clock_skew_tolerance_secs, 5);
    }

    #[test]
    fn set_rejects_unknown_key() {
        let mut cfg = SyncConfig::default();
        assert!(matches!(
            cfg.set("run.nonexistent", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(cfg.set("run", "1"), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn set_rejects_lease_shorter_than_run() {
        let mut cfg = SyncConfig::default();
        let err = cfg.set("lease.ttl_secs", "60").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(cfg.lease.ttl_secs, 900);
    }

    #[test]
    fn validate_rejects_out_of_range_jitter() {
        let mut cfg = SyncConfig::default();
        cfg.retry.jitter = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        let cfg = SyncConfig::load_from(&path).unwrap();
        assert_eq!(cfg, SyncConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn load_from_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[lease]\nttl_secs = 10\n").unwrap();
        assert!(SyncConfig::load_from(&path).is_err());
    }
}
