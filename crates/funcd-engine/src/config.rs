// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for funcd.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use funcd_daemon::DaemonConfig;

/// Default metadata store location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/funcd.db?mode=rwc";

/// Largest accepted `max_memory_mb` (1 TiB).
pub const MAX_MEMORY_MB: u64 = 1024 * 1024;

/// Bounds applied to every invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Hard deadline for a single container run.
    pub timeout: Duration,
    /// Memory ceiling per container in MB (swap capped to the same).
    pub max_memory_mb: u64,
    /// Maximum containers running at once across all functions.
    pub max_concurrent: usize,
    /// CPUs per container.
    pub cpu_share: f64,
    /// Container network mode.
    pub network_mode: String,
    /// How long an invocation waits for a free slot before it is rejected.
    pub slot_wait: Duration,
    /// Interval between container state polls while waiting for exit.
    pub wait_poll_interval: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory_mb: 20,
            max_concurrent: 16,
            cpu_share: 0.5,
            network_mode: "none".to_string(),
            slot_wait: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ResourceLimits {
    /// Load limits from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout_secs: u64 = parse_env("FUNCD_EXECUTION_TIMEOUT_SECS", 30)?;
        let max_memory_mb: u64 = parse_env("FUNCD_MAX_MEMORY_MB", defaults.max_memory_mb)?;
        let max_concurrent: usize =
            parse_env("FUNCD_MAX_CONCURRENT_EXECUTIONS", defaults.max_concurrent)?;
        let cpu_share: f64 = parse_env("FUNCD_CPU_SHARE", defaults.cpu_share)?;
        let slot_wait_ms: u64 = parse_env("FUNCD_SLOT_WAIT_MS", 100)?;
        let network_mode =
            std::env::var("FUNCD_NETWORK_MODE").unwrap_or_else(|_| defaults.network_mode.clone());

        let limits = Self {
            timeout: Duration::from_secs(timeout_secs),
            max_memory_mb,
            max_concurrent,
            cpu_share,
            network_mode,
            slot_wait: Duration::from_millis(slot_wait_ms),
            wait_poll_interval: defaults.wait_poll_interval,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Reject limits that would make every invocation fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::OutOfRange("FUNCD_EXECUTION_TIMEOUT_SECS"));
        }
        if self.max_memory_mb == 0 || self.max_memory_mb > MAX_MEMORY_MB {
            return Err(ConfigError::OutOfRange("FUNCD_MAX_MEMORY_MB"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::OutOfRange("FUNCD_MAX_CONCURRENT_EXECUTIONS"));
        }
        if self.cpu_share.is_nan() || self.cpu_share <= 0.0 {
            return Err(ConfigError::OutOfRange("FUNCD_CPU_SHARE"));
        }
        Ok(())
    }

    /// Memory ceiling in bytes, saturating for limits that skipped [`validate`](Self::validate).
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.max_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }
}

/// funcd configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Metadata store URL (`sqlite:` or `postgres://`).
    pub database_url: String,
    /// Data directory; artifacts live under `{data_dir}/artifacts`.
    pub data_dir: PathBuf,
    /// Container daemon connection.
    pub daemon: DaemonConfig,
    /// Attempts for image pulls and builds that hit transient daemon errors.
    pub retry_attempts: u32,
    /// Invocation limits.
    pub limits: ResourceLimits,
    /// Orphan reaper interval.
    pub reaper_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("FUNCD_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let retry_attempts: u32 = parse_env("FUNCD_DAEMON_RETRY_ATTEMPTS", 3)?;
        if retry_attempts == 0 {
            return Err(ConfigError::OutOfRange("FUNCD_DAEMON_RETRY_ATTEMPTS"));
        }

        let reaper_poll_secs: u64 = parse_env("FUNCD_REAPER_POLL_SECS", 60)?;

        Ok(Self {
            database_url,
            data_dir,
            daemon: DaemonConfig::from_env(),
            retry_attempts,
            limits: ResourceLimits::from_env()?,
            reaper_poll_interval: Duration::from_secs(reaper_poll_secs),
        })
    }

    /// Directory holding deployment artifacts.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// A variable parses but is outside its allowed range.
    #[error("Value out of range for {0}")]
    OutOfRange(&'static str),
}
