//! Runtime configuration.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::persistence::{DEFAULT_ACTIONS_KEY, DEFAULT_QUEUE_KEY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be true or false, got {value:?}")]
    InvalidBool { name: &'static str, value: String },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

/// Sync coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL relative endpoints are joined to.
    pub api_url: String,
    /// Period of the background pass timer.
    pub sync_interval: Duration,
    /// Wait after reconnecting before the reconnect pass.
    pub reconnect_settle: Duration,
    /// Deadline of a single delivery attempt.
    pub attempt_timeout: Duration,
    /// Retry budget for items that don't specify one.
    pub default_max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub queue_key: String,
    pub actions_key: String,
    /// Connectivity assumed before the first event arrives.
    pub start_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            sync_interval: Duration::from_secs(30),
            reconnect_settle: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
            backoff: BackoffPolicy::default(),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            actions_key: DEFAULT_ACTIONS_KEY.to_string(),
            start_online: true,
        }
    }
}

impl SyncConfig {
    /// Read `OFFSYNC_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string());

        if let Some(url) = get("OFFSYNC_API_URL") {
            if url.is_empty() {
                return Err(ConfigError::Empty { name: "OFFSYNC_API_URL" });
            }
            config.api_url = url;
        }

        if let Some(v) = get("OFFSYNC_SYNC_INTERVAL_SECS") {
            let secs = positive("OFFSYNC_SYNC_INTERVAL_SECS", &v)?;
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("OFFSYNC_RECONNECT_SETTLE_MS") {
            config.reconnect_settle = Duration::from_millis(number("OFFSYNC_RECONNECT_SETTLE_MS", &v)?);
        }
        if let Some(v) = get("OFFSYNC_ATTEMPT_TIMEOUT_SECS") {
            let secs = positive("OFFSYNC_ATTEMPT_TIMEOUT_SECS", &v)?;
            config.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("OFFSYNC_DEFAULT_MAX_ATTEMPTS") {
            let n = positive("OFFSYNC_DEFAULT_MAX_ATTEMPTS", &v)?;
            config.default_max_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }

        if let Some(v) = get("OFFSYNC_BACKOFF_BASE_MS") {
            config.backoff.base_delay = Duration::from_millis(number("OFFSYNC_BACKOFF_BASE_MS", &v)?);
        }
        if let Some(v) = get("OFFSYNC_BACKOFF_MAX_MS") {
            config.backoff.max_delay = Duration::from_millis(number("OFFSYNC_BACKOFF_MAX_MS", &v)?);
        }
        if let Some(v) = get("OFFSYNC_BACKOFF_JITTER_MS") {
            config.backoff.jitter = Duration::from_millis(number("OFFSYNC_BACKOFF_JITTER_MS", &v)?);
        }

        if let Some(key) = get("OFFSYNC_QUEUE_KEY") {
            if key.is_empty() {
                return Err(ConfigError::Empty { name: "OFFSYNC_QUEUE_KEY" });
            }
            config.queue_key = key;
        }
        if let Some(key) = get("OFFSYNC_ACTIONS_KEY") {
            if key.is_empty() {
                return Err(ConfigError::Empty { name: "OFFSYNC_ACTIONS_KEY" });
            }
            config.actions_key = key;
        }

        if let Some(v) = get("OFFSYNC_START_ONLINE") {
            config.start_online = boolean("OFFSYNC_START_ONLINE", &v)?;
        }

        Ok(config)
    }
}

fn number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

fn positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match number(name, value)? {
        0 => Err(ConfigError::Zero { name }),
        n => Ok(n),
    }
}

fn boolean(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}
