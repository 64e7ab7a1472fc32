//! Engine Configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! no file at all) yields a usable configuration.
//!
//! ```yaml
//! max_retries: 3
//! poll_interval_secs: 5
//! step_timeouts:
//!   upload-app: 7200
//! cleanup:
//!   grace_window_minutes: 30
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Environment variable overriding the default state directory.
pub const STATE_DIR_ENV: &str = "MTARUNNER_STATE_DIR";

/// Directory holding locks, snapshots and history when none is configured.
pub static DEFAULT_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(".mtarunner")
});

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_parallel() -> usize {
    num_cpus::get()
}

fn default_state_dir() -> PathBuf {
    DEFAULT_STATE_DIR.clone()
}

/// Upper bound of every clean-up duration, about a century.
const MAX_CLEANUP_DAYS: u64 = 36_500;

const MINUTES_PER_DAY: u64 = 24 * 60;

fn default_grace_window_minutes() -> u64 {
    30
}

fn default_sweep_interval_minutes() -> u64 {
    60
}

fn default_deleted_space_lookback_days() -> u64 {
    1
}

/// Settings for the operation engine and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries allowed per step before a retryable failure becomes fatal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before a polling or retrying instance is ticked again
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum number of ticks running at the same time
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Per-step timeout overrides in seconds, keyed by step name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_timeouts: HashMap<String, u64>,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Settings for the reconciliation sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Age an aborted operation or a lock must reach before it is reconciled
    #[serde(default = "default_grace_window_minutes")]
    pub grace_window_minutes: u64,

    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,

    /// How far back the audit stream is searched for deleted spaces
    #[serde(default = "default_deleted_space_lookback_days")]
    pub deleted_space_lookback_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_window_minutes: default_grace_window_minutes(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
            deleted_space_lookback_days: default_deleted_space_lookback_days(),
        }
    }
}

fn bounded_minutes(field: &str, minutes: u64) -> Result<Duration, ConfigError> {
    let max = MAX_CLEANUP_DAYS * MINUTES_PER_DAY;
    if minutes > max {
        return Err(ConfigError::Invalid(format!(
            "{} must be at most {} minutes",
            field, max
        )));
    }
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::Invalid(format!("{} is out of range", field)))
}

fn to_time_delta(field: &str, duration: Duration) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| ConfigError::Invalid(format!("{} is out of range", field)))
}

impl CleanupConfig {
    pub fn grace_window(&self) -> Result<chrono::Duration, ConfigError> {
        let field = "cleanup.grace_window_minutes";
        to_time_delta(field, bounded_minutes(field, self.grace_window_minutes)?)
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        bounded_minutes("cleanup.sweep_interval_minutes", self.sweep_interval_minutes)
    }

    pub fn deleted_space_lookback(&self) -> Result<chrono::Duration, ConfigError> {
        let field = "cleanup.deleted_space_lookback_days";
        if self.deleted_space_lookback_days > MAX_CLEANUP_DAYS {
            return Err(ConfigError::Invalid(format!(
                "{} must be at most {} days",
                field, MAX_CLEANUP_DAYS
            )));
        }
        let minutes = self.deleted_space_lookback_days * MINUTES_PER_DAY;
        to_time_delta(field, bounded_minutes(field, minutes)?)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            poll_interval_secs: default_poll_interval_secs(),
            max_parallel: default_max_parallel(),
            step_timeouts: HashMap::new(),
            state_dir: default_state_dir(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".to_string()));
        }
        if self.cleanup.sweep_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.sweep_interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.cleanup.grace_window_minutes == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.grace_window_minutes must be at least 1".to_string(),
            ));
        }
        self.cleanup.grace_window()?;
        self.cleanup.sweep_interval()?;
        self.cleanup.deleted_space_lookback()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Configured timeout for a step, if one overrides the step's own.
    pub fn step_timeout_override(&self, step: &str) -> Option<Duration> {
        self.step_timeouts.get(step).map(|secs| Duration::from_secs(*secs))
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}
