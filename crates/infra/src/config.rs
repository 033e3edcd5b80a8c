//! Configuration loading and representation.
//!
//! Values come from the process environment. Parsing goes through a lookup
//! function so the same code can be fed a fixed map in tests.

use std::time::Duration;

use crate::jobs::{DispatcherConfig, RuntimeConfig, SweeperConfig};

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "FEDIQ_DB_MAX_CONNECTIONS";
pub const POLL_INTERVAL_MS: &str = "FEDIQ_POLL_INTERVAL_MS";
pub const HEARTBEAT_INTERVAL_SECS: &str = "FEDIQ_HEARTBEAT_INTERVAL_SECS";
pub const LIVENESS_TIMEOUT_SECS: &str = "FEDIQ_LIVENESS_TIMEOUT_SECS";
pub const SWEEP_INTERVAL_SECS: &str = "FEDIQ_SWEEP_INTERVAL_SECS";
pub const SHUTDOWN_GRACE_SECS: &str = "FEDIQ_SHUTDOWN_GRACE_SECS";
pub const STATS_INTERVAL_SECS: &str = "FEDIQ_STATS_INTERVAL_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Job queue process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    /// How often the worker daemon logs per-queue counts.
    pub stats_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from `lookup`, which returns the raw value of a variable if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: get(DATABASE_URL),
            db_max_connections: match get(DB_MAX_CONNECTIONS) {
                Some(v) => parse_positive(DB_MAX_CONNECTIONS, &v)?,
                None => defaults.db_max_connections,
            },
            poll_interval: match get(POLL_INTERVAL_MS) {
                Some(v) => Duration::from_millis(parse_positive(POLL_INTERVAL_MS, &v)?),
                None => defaults.poll_interval,
            },
            heartbeat_interval: secs_or(&get, HEARTBEAT_INTERVAL_SECS, defaults.heartbeat_interval)?,
            liveness_timeout: secs_or(&get, LIVENESS_TIMEOUT_SECS, defaults.liveness_timeout)?,
            sweep_interval: secs_or(&get, SWEEP_INTERVAL_SECS, defaults.sweep_interval)?,
            shutdown_grace: secs_or(&get, SHUTDOWN_GRACE_SECS, defaults.shutdown_grace)?,
            stats_interval: secs_or(&get, STATS_INTERVAL_SECS, defaults.stats_interval)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject zero durations and a liveness timeout that does not exceed the
    /// heartbeat interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(POLL_INTERVAL_MS, self.poll_interval)?;
        require_nonzero(HEARTBEAT_INTERVAL_SECS, self.heartbeat_interval)?;
        require_nonzero(LIVENESS_TIMEOUT_SECS, self.liveness_timeout)?;
        require_nonzero(SWEEP_INTERVAL_SECS, self.sweep_interval)?;
        require_nonzero(STATS_INTERVAL_SECS, self.stats_interval)?;
        if self.liveness_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                name: LIVENESS_TIMEOUT_SECS,
                value: self.liveness_timeout.as_secs().to_string(),
                reason: format!(
                    "must exceed the heartbeat interval ({}s)",
                    self.heartbeat_interval.as_secs()
                ),
            });
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(DATABASE_URL))
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::default()
            .with_dispatcher(
                DispatcherConfig::default()
                    .with_poll_interval(self.poll_interval)
                    .with_heartbeat_interval(self.heartbeat_interval)
                    .with_shutdown_grace(self.shutdown_grace),
            )
            .with_sweeper(self.sweeper_config())
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_interval(self.sweep_interval)
            .with_liveness_timeout(self.liveness_timeout)
    }
}

/// `Invalid` if `value` is zero.
pub(crate) fn require_nonzero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            name,
            value: format!("{value:?}"),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn parse_positive<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason,
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if value == T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}

fn secs_or(
    get: impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(name) {
        Some(v) => Ok(Duration::from_secs(parse_positive(name, &v)?)),
        None => Ok(default),
    }
}
