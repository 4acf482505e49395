//! Realtime Configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! configuration for the in-memory feed. The hosted feed additionally needs
//! `provider.endpoint` and an API key (from the file or `VITALSYNC_API_KEY`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::realtime::{RealtimeError, RealtimeResult};

/// Environment variable consulted when `provider.api_key` is absent
pub const API_KEY_ENV: &str = "VITALSYNC_API_KEY";

/// Registry and monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Coalescing window in milliseconds (default: 300)
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,

    /// Database schema the tables live in (default: "public")
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Column holding the owning user's id (default: "user_id")
    #[serde(default = "default_user_column")]
    pub user_column: String,

    /// Stats polling interval in milliseconds (default: 2000)
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Hosted change feed
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Hosted change feed connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    #[serde(default)]
    pub endpoint: String,

    /// Anonymous API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Heartbeat interval in seconds (default: 30)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Seconds to wait for a join reply (default: 10)
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

fn default_debounce_window_ms() -> u64 {
    300
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_user_column() -> String {
    "user_id".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_join_timeout_secs() -> u64 {
    10
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: default_debounce_window_ms(),
            schema: default_schema(),
            user_column: default_user_column(),
            monitor_interval_ms: default_monitor_interval_ms(),
            provider: ProviderConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl RealtimeConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> RealtimeResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a configuration document
    pub fn from_json(content: &str) -> RealtimeResult<Self> {
        let mut config: RealtimeConfig = serde_json::from_str(content)
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid config JSON: {}", e)))?;

        if config.provider.api_key.is_none() {
            config.provider.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values the registry cannot work with
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.debounce_window_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "debounce_window_ms must be > 0".into(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "monitor_interval_ms must be > 0".into(),
            ));
        }
        if self.schema.trim().is_empty() {
            return Err(RealtimeError::ConfigError("schema must not be empty".into()));
        }
        if self.user_column.trim().is_empty()
            || !self
                .user_column
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(RealtimeError::ConfigError(format!(
                "Invalid user_column: '{}'",
                self.user_column
            )));
        }
        self.provider.validate()
    }

    /// Coalescing window
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    /// Stats polling interval
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Override the coalescing window
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window_ms = window.as_millis().max(1) as u64;
        self
    }
}

impl ProviderConfig {
    fn validate(&self) -> RealtimeResult<()> {
        if !self.endpoint.is_empty()
            && !(self.endpoint.starts_with("http://")
                || self.endpoint.starts_with("https://")
                || self.endpoint.starts_with("ws://")
                || self.endpoint.starts_with("wss://"))
        {
            return Err(RealtimeError::ConfigError(format!(
                "Invalid provider endpoint: '{}'",
                self.endpoint
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(RealtimeError::ConfigError(
                "heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.join_timeout_secs == 0 {
            return Err(RealtimeError::ConfigError(
                "join_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Whether enough is set to connect to the hosted feed
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty() && self.api_key.is_some()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// WebSocket URL of the realtime endpoint
    pub fn websocket_url(&self) -> RealtimeResult<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            RealtimeError::ConfigError(format!("provider.api_key or {} is required", API_KEY_ENV))
        })?;

        let base = self.endpoint.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(RealtimeError::ConfigError(
                "provider.endpoint is required".into(),
            ));
        };

        Ok(format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base, api_key
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RealtimeConfig::default();
        assert_eq!(config.debounce_window(), Duration::from_millis(300));
        assert_eq!(config.monitor_interval(), Duration::from_secs(2));
        assert_eq!(config.schema, "public");
        assert_eq!(config.user_column, "user_id");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RealtimeConfig::from_json("{}").unwrap();
        assert_eq!(config.debounce_window_ms, 300);
        assert_eq!(config.provider.heartbeat_interval_secs, 30);
        assert_eq!(config.provider.join_timeout_secs, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"debounce_window_ms": 150, "user_column": "owner_id",
                "provider": {{"endpoint": "https://demo.supabase.co", "api_key": "anon"}}}}"#
        )
        .unwrap();

        let config = RealtimeConfig::load(file.path()).unwrap();
        assert_eq!(config.debounce_window(), Duration::from_millis(150));
        assert_eq!(config.user_column, "owner_id");
        assert!(config.provider.is_configured());
    }

    #[test]
    fn test_missing_file() {
        let result = RealtimeConfig::load(Path::new("/nonexistent/vitalsync.json"));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_zero_window() {
        assert!(RealtimeConfig::from_json(r#"{"debounce_window_ms": 0}"#).is_err());
        assert!(RealtimeConfig::from_json(r#"{"monitor_interval_ms": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_bad_user_column() {
        assert!(RealtimeConfig::from_json(r#"{"user_column": "user id"}"#).is_err());
        assert!(RealtimeConfig::from_json(r#"{"user_column": ""}"#).is_err());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let result = RealtimeConfig::from_json(r#"{"provider": {"endpoint": "ftp://x"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(RealtimeConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_websocket_url() {
        let provider = ProviderConfig {
            endpoint: "https://demo.supabase.co/".into(),
            api_key: Some("anon".into()),
            ..ProviderConfig::default()
        };
        assert_eq!(
            provider.websocket_url().unwrap(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = ProviderConfig {
            endpoint: "http://127.0.0.1:54321".into(),
            api_key: Some("k".into()),
            ..ProviderConfig::default()
        };
        assert!(local.websocket_url().unwrap().starts_with("ws://127.0.0.1:54321/"));
    }

    #[test]
    fn test_websocket_url_requires_key_and_endpoint() {
        let no_key = ProviderConfig {
            endpoint: "https://demo.supabase.co".into(),
            ..ProviderConfig::default()
        };
        assert!(no_key.websocket_url().is_err());

        let no_endpoint = ProviderConfig {
            api_key: Some("anon".into()),
            ..ProviderConfig::default()
        };
        assert!(no_endpoint.websocket_url().is_err());
    }

    #[test]
    fn test_with_debounce_window() {
        let config = RealtimeConfig::default().with_debounce_window(Duration::from_millis(50));
        assert_eq!(config.debounce_window_ms, 50);
    }
}
