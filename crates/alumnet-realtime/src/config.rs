//! Realtime manager configuration.
//!
//! Configuration is JSON on disk. [`ClientConfig`] bundles the manager
//! settings with the WebSocket transport settings so a host needs one file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RealtimeError;

/// What happens once the reconnection budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Enter `Degraded`, which counts as ready, so features proceed without
    /// realtime delivery.
    #[default]
    Degrade,
    /// Stay `Disconnected` and keep the gate closed until a manual `start()`.
    StayDisconnected,
}

/// Settings for the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Delay before the first reconnection attempt, in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound for any reconnection delay, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Automatic reconnection attempts before the exhaustion policy applies.
    pub max_attempts: u32,
    /// Default time a subscriber waits for readiness, in milliseconds.
    pub ready_wait_timeout_ms: u64,
    /// Whether subscribers proceed in fallback mode after that wait.
    pub allow_fallback: bool,
    /// Policy once `max_attempts` is exhausted.
    pub on_exhaustion: ExhaustionPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_attempts: 8,
            ready_wait_timeout_ms: 15_000,
            allow_fallback: true,
            on_exhaustion: ExhaustionPolicy::Degrade,
        }
    }
}

impl RealtimeConfig {
    /// Base backoff as a duration.
    #[must_use]
    pub const fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Backoff cap as a duration.
    #[must_use]
    pub const fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Default readiness wait as a duration.
    #[must_use]
    pub const fn ready_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_wait_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.base_backoff_ms == 0 {
            return Err(RealtimeError::Config(
                "base_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.backoff_cap_ms < self.base_backoff_ms {
            return Err(RealtimeError::Config(
                "backoff_cap_ms must be at least base_backoff_ms".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(RealtimeError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ready_wait_timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "ready_wait_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsConfig {
    /// Realtime endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Project API key, sent as the `apikey` query parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// User access token sent when joining topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Unanswered heartbeats before the connection is declared dead.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    /// How long to wait for a join reply, in milliseconds.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

const fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

const fn default_max_missed_heartbeats() -> u32 {
    2
}

const fn default_join_timeout_ms() -> u64 {
    10_000
}

impl WsConfig {
    /// Settings for `url` with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            access_token: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL scheme or a timing is invalid.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.url.is_empty() {
            return Err(RealtimeError::Config("url cannot be empty".to_string()));
        }
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(RealtimeError::Config(
                "url must start with ws:// or wss://".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RealtimeError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(RealtimeError::Config(
                "max_missed_heartbeats must be at least 1".to_string(),
            ));
        }
        if self.join_timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "join_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a host needs to run the realtime layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Lifecycle settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Transport settings.
    pub transport: WsConfig,
}

impl ClientConfig {
    /// Defaults pointed at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            realtime: RealtimeConfig::default(),
            transport: WsConfig::new(url),
        }
    }

    /// Load and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RealtimeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RealtimeError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, RealtimeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| RealtimeError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RealtimeError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate both sections.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        self.realtime.validate()?;
        self.transport.validate()
    }
}
