use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::events::{EventQueue, OverflowPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    // Session settings
    pub max_sessions: usize, // 0 = unlimited
    pub session_idle_timeout_secs: Option<u64>,

    // Event delivery
    pub event_queue: EventQueueConfig,
    pub default_drain_max: usize,
    pub default_wait_timeout_ms: u64,

    // Logging
    pub log_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueueConfig {
    /// Maximum pending records per session; absent = unbounded
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl EventQueueConfig {
    pub fn build_queue(&self) -> EventQueue {
        EventQueue::with_limits(self.capacity, self.overflow)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            session_idle_timeout_secs: None,
            event_queue: EventQueueConfig::default(),
            default_drain_max: 100,
            default_wait_timeout_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;

        let config: CoreConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        if let Some(max) = env_parse::<usize>("RFH_MAX_SESSIONS") {
            config.max_sessions = max;
        }
        if let Some(capacity) = env_parse::<usize>("RFH_QUEUE_CAPACITY") {
            config.event_queue.capacity = Some(capacity);
        }
        if let Some(policy) = env_parse::<OverflowPolicy>("RFH_OVERFLOW_POLICY") {
            config.event_queue.overflow = policy;
        }
        if let Some(max) = env_parse::<usize>("RFH_DRAIN_MAX") {
            config.default_drain_max = max;
        }
        if let Some(ms) = env_parse::<u64>("RFH_WAIT_TIMEOUT_MS") {
            config.default_wait_timeout_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("RFH_SESSION_IDLE_SECS") {
            config.session_idle_timeout_secs = Some(secs);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_queue.capacity == Some(0) {
            return Err(ConfigError::ValidationError(
                "event_queue.capacity must be at least 1 when set".to_string(),
            ));
        }
        if self.default_drain_max == 0 {
            return Err(ConfigError::ValidationError(
                "default_drain_max must be at least 1".to_string(),
            ));
        }
        if self.session_idle_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "session_idle_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_secs.map(Duration::from_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
