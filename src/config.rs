//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Tensor cache sizing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct CacheConfig {
    /// Upper bound on bytes of full tensor buffers kept in memory per session.
    pub tensor_cache_byte_budget: u64,
    /// Keep statistics for at most this many of the most recent steps.
    ///
    /// Absent means statistics are never dropped.
    pub stats_step_limit: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tensor_cache_byte_budget: 256 * 1024 * 1024,
            stats_step_limit: None,
        }
    }
}

/// Liveness and acknowledgement deadlines (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TimeoutConfig {
    /// Heartbeat silence after which the session terminates.
    pub heartbeat_timeout_ms: u64,
    /// Time a control command may wait for its acknowledgement.
    pub command_ack_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            command_ack_timeout_ms: 10_000,
        }
    }
}

/// Per-session limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// Maximum number of registered watchpoints.
    pub max_watchpoints_per_session: usize,
    /// Seconds a terminated session stays readable before it is collected.
    pub terminated_retention_seconds: u64,
    /// Consecutive dropped frames tolerated before the stream is declared corrupt.
    pub max_consecutive_protocol_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_watchpoints_per_session: 64,
            terminated_retention_seconds: 600,
            max_consecutive_protocol_errors: 64,
        }
    }
}

/// Inbound stream framing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct StreamConfig {
    /// Maximum length of one NDJSON frame line.
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Global configuration parsed from `tensorwatch.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Address the training-process listener binds to.
    pub listen_addr: String,
    /// Named pipe / Unix socket identifier for `tensorwatch-ctl`.
    pub ipc_name: String,
    /// Maximum number of sessions held by the session manager.
    pub max_sessions: usize,
    /// Tensor cache sizing.
    pub cache: CacheConfig,
    /// Heartbeat and acknowledgement deadlines.
    pub timeouts: TimeoutConfig,
    /// Per-session limits.
    pub session: SessionConfig,
    /// Stream framing limits.
    pub stream: StreamConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50051".into(),
            ipc_name: "tensorwatch".into(),
            max_sessions: 8,
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            session: SessionConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.heartbeat_timeout_ms)
    }

    /// Command acknowledgement timeout as a [`Duration`].
    #[must_use]
    pub fn command_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ack_timeout_ms)
    }

    /// Retention window for terminated sessions.
    #[must_use]
    pub fn terminated_retention(&self) -> Duration {
        Duration::from_secs(self.session.terminated_retention_seconds)
    }

    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(AppError::Config(
                "max_sessions must be greater than zero".into(),
            ));
        }
        if self.cache.tensor_cache_byte_budget == 0 {
            return Err(AppError::Config(
                "tensor_cache_byte_budget must be greater than zero".into(),
            ));
        }
        if self.cache.stats_step_limit == Some(0) {
            return Err(AppError::Config(
                "stats_step_limit must be greater than zero when set".into(),
            ));
        }
        if self.timeouts.heartbeat_timeout_ms == 0 || self.timeouts.command_ack_timeout_ms == 0 {
            return Err(AppError::Config("timeouts must be greater than zero".into()));
        }
        if self.session.max_watchpoints_per_session == 0 {
            return Err(AppError::Config(
                "max_watchpoints_per_session must be greater than zero".into(),
            ));
        }
        if self.stream.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(AppError::Config("listen_addr must not be empty".into()));
        }
        Ok(())
    }
}
