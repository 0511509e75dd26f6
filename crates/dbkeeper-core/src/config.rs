//! dbkeeper.toml configuration parser.
//!
//! Every section and every field is optional; missing values fall back to
//! the defaults below. Durations are plain integers with the unit in the
//! field name so the file stays readable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pool.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("pool.min_connections ({min}) exceeds pool.max_connections ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("cache.max_size must be greater than zero when the cache is enabled")]
    ZeroCacheSize,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("health.busy_ratio_warning must be within (0, 1], got {0}")]
    BusyRatioOutOfRange(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbKeeperConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
    pub health: HealthConfig,
}

/// Connection pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Floor for pool size; reclamation never goes below it (default: 5).
    pub min_connections: usize,
    /// Hard cap on connections created (default: 20).
    pub max_connections: usize,
    /// How long a queued acquire waits before failing (default: 30s).
    pub acquire_timeout_ms: u64,
    /// Idle time after which a connection may be reclaimed (default: 60s).
    pub idle_timeout_ms: u64,
    /// Interval between reclamation sweeps (default: 30s).
    pub health_check_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 20,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Statement result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch (default: true).
    pub enabled: bool,
    /// Entry-count cap before eviction (default: 1000).
    pub max_size: usize,
    /// Seconds until an entry expires when no TTL is given (default: 300).
    pub default_ttl_secs: u64,
    /// Statement keywords that are never cached, matched as whole words
    /// ignoring case.
    pub exclude_patterns: Vec<String>,
    /// Milliseconds subtracted from an entry's eviction score per hit; the
    /// lowest score is evicted first (default: 1000).
    pub hit_weight_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            default_ttl_secs: 300,
            exclude_patterns: ["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"]
                .into_iter()
                .map(String::from)
                .collect(),
            hit_weight_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Average time above which a statement shape counts as slow (default: 1000ms).
    pub slow_query_threshold_ms: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between metrics snapshots (default: 60s).
    pub interval_ms: u64,
    /// Snapshots retained in the rolling history (default: 1440, one day at 60s).
    pub max_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            max_history: 1440,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Health classification thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health verdicts (default: 30s).
    pub interval_ms: u64,
    /// Upper bound on the probe's acquire (default: 10s).
    pub probe_timeout_ms: u64,
    /// Probe response time reported as a warning (default: 2000ms).
    pub response_warning_ms: u64,
    /// Probe response time reported as critical (default: 5000ms).
    pub response_critical_ms: u64,
    /// Queued acquires above which the pool is reported as saturated (default: 10).
    pub max_waiting: usize,
    /// Busy/total ratio above which utilization is reported (default: 0.9).
    pub busy_ratio_warning: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 10_000,
            response_warning_ms: 2000,
            response_critical_ms: 5000,
            max_waiting: 10,
            busy_ratio_warning: 0.9,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl DbKeeperConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DbKeeperConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if pool.min_connections > pool.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: pool.min_connections,
                max: pool.max_connections,
            });
        }
        if pool.health_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("pool.health_check_interval_ms"));
        }
        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("monitor.interval_ms"));
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("health.interval_ms"));
        }
        let ratio = self.health.busy_ratio_warning;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::BusyRatioOutOfRange(ratio));
        }
        Ok(())
    }
}
