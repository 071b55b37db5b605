//! Event sourcing configuration.
//!
//! Defaults suit a single local agent; every field can be overridden through
//! `SCENELOG_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use scenelog_observability::LogFormat;

pub const ENV_DB_PATH: &str = "SCENELOG_DB_PATH";
pub const ENV_ENABLE_SNAPSHOTS: &str = "SCENELOG_ENABLE_SNAPSHOTS";
pub const ENV_SNAPSHOT_FREQUENCY: &str = "SCENELOG_SNAPSHOT_FREQUENCY";
pub const ENV_ENABLE_PROJECTIONS: &str = "SCENELOG_ENABLE_PROJECTIONS";
pub const ENV_PROJECTION_INTERVAL_MS: &str = "SCENELOG_PROJECTION_INTERVAL_MS";
pub const ENV_ENABLE_TIME_TRAVEL: &str = "SCENELOG_ENABLE_TIME_TRAVEL";
pub const ENV_LOG_FORMAT: &str = "SCENELOG_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value `{value}` for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSourcingConfig {
    pub db_path: PathBuf,
    pub enable_snapshots: bool,
    /// Save a snapshot every this many versions of an aggregate.
    pub snapshot_frequency: u64,
    pub enable_projections: bool,
    pub projection_update_interval: Duration,
    pub enable_time_travel: bool,
    pub log_format: LogFormat,
}

impl Default for EventSourcingConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(std::env::var_os("HOME").map(PathBuf::from)),
            enable_snapshots: true,
            snapshot_frequency: 100,
            enable_projections: true,
            projection_update_interval: Duration::from_secs(1),
            enable_time_travel: true,
            log_format: LogFormat::Json,
        }
    }
}

/// `~/.scene_agent/events.db`, or `./events.db` without a home directory.
fn default_db_path(home: Option<PathBuf>) -> PathBuf {
    match home {
        Some(home) => home.join(".scene_agent").join("events.db"),
        None => PathBuf::from("events.db"),
    }
}

impl EventSourcingConfig {
    /// Defaults overridden by any `SCENELOG_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH) {
            if path.trim().is_empty() {
                return Err(invalid(ENV_DB_PATH, &path, "must not be empty"));
            }
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_ENABLE_SNAPSHOTS) {
            config.enable_snapshots = parse_bool(ENV_ENABLE_SNAPSHOTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SNAPSHOT_FREQUENCY) {
            let frequency = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(ENV_SNAPSHOT_FREQUENCY, &raw, &e.to_string()))?;
            if frequency == 0 {
                return Err(invalid(ENV_SNAPSHOT_FREQUENCY, &raw, "must be at least 1"));
            }
            config.snapshot_frequency = frequency;
        }
        if let Some(raw) = lookup(ENV_ENABLE_PROJECTIONS) {
            config.enable_projections = parse_bool(ENV_ENABLE_PROJECTIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROJECTION_INTERVAL_MS) {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(ENV_PROJECTION_INTERVAL_MS, &raw, &e.to_string()))?;
            if millis == 0 {
                return Err(invalid(ENV_PROJECTION_INTERVAL_MS, &raw, "must be at least 1"));
            }
            config.projection_update_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup(ENV_ENABLE_TIME_TRAVEL) {
            config.enable_time_travel = parse_bool(ENV_ENABLE_TIME_TRAVEL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_FORMAT) {
            config.log_format = raw
                .parse()
                .map_err(|e: scenelog_observability::UnknownLogFormat| {
                    invalid(ENV_LOG_FORMAT, &raw, &e.to_string())
                })?;
        }

        Ok(config)
    }

    /// Defaults with the database at `db_path`.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw, "expected a boolean")),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
