//! dbkeeper-core: configuration and shared helpers for the dbkeeper crates.
//!
//! Every component takes its section of [`DbKeeperConfig`] at construction
//! time; nothing in the workspace reads global state.

pub mod config;
pub mod types;

pub use config::{
    CacheConfig, ConfigError, DbKeeperConfig, HealthConfig, MonitorConfig, OptimizerConfig,
    PoolConfig,
};
pub use types::*;
