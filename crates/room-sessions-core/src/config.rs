//! Layered configuration: defaults, optional file, then `ROOM_SESSIONS_*` environment.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::policy::LivenessPolicy;

/// Environment variable prefix, e.g. `ROOM_SESSIONS_KILL_THRESHOLD_SECONDS`.
pub const ENV_PREFIX: &str = "ROOM_SESSIONS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid liveness policy: {0}")]
    InvalidPolicy(String),
}

/// Runtime settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub heartbeat_interval_seconds: u64,
    pub kill_threshold_seconds: u64,
    pub max_recovery_attempts: u32,
    /// Defaults to half the kill threshold.
    #[serde(default)]
    pub reaper_interval_seconds: Option<u64>,
    /// Attempts for a session creation that keeps failing transiently.
    pub create_retry_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub create_retry_backoff_ms: u64,
    /// `sqlite://...` URL, or `memory` for the in-process store.
    pub database_url: String,
    pub bind_addr: String,
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self, ConfigError> {
        let mut builder = defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        let settings = builder.add_source(env.try_parsing(true)).build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load settings from defaults overlaid with a TOML document.
    ///
    /// # Errors
    /// Returns error if the document does not parse.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Validate the timing fields.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPolicy`] for combinations that would flap.
    pub fn policy(&self) -> Result<LivenessPolicy, ConfigError> {
        LivenessPolicy::new(
            self.heartbeat_interval_seconds,
            self.kill_threshold_seconds,
            self.max_recovery_attempts,
            self.reaper_interval_seconds,
        )
    }
}

fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    Ok(config::Config::builder()
        .set_default("heartbeat_interval_seconds", 30_i64)?
        .set_default("kill_threshold_seconds", 90_i64)?
        .set_default("max_recovery_attempts", 3_i64)?
        .set_default("create_retry_attempts", 4_i64)?
        .set_default("create_retry_backoff_ms", 100_i64)?
        .set_default("database_url", "sqlite://room_sessions.db?mode=rwc")?
        .set_default("bind_addr", "127.0.0.1:3000")?)
}
