//! dbkeeperd: the dbkeeper daemon.
//!
//! Assembles every dbkeeper component against one database endpoint:
//! - Connection pool (plain TCP)
//! - Query cache
//! - Query analyzer
//! - Metrics monitor
//! - Health checker
//!
//! # Usage
//!
//! ```text
//! dbkeeperd run --config dbkeeper.toml --target db.internal:5432
//! dbkeeperd check --target db.internal:5432
//! dbkeeperd config --config dbkeeper.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dbkeeper_analyzer::QueryOptimizer;
use dbkeeper_cache::QueryCache;
use dbkeeper_core::DbKeeperConfig;
use dbkeeper_health::HealthChecker;
use dbkeeper_metrics::DatabaseMonitor;
use dbkeeper_pool::{ConnectionPool, TcpConnectionFactory};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbkeeperd", about = "dbkeeper database resource daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Target {
    /// Path to dbkeeper.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database endpoint as host:port.
    #[arg(long)]
    target: String,

    /// TCP connect timeout in milliseconds.
    #[arg(long, default_value = "5000")]
    connect_timeout_ms: u64,

    /// Read timeout on pooled connections in milliseconds.
    #[arg(long, default_value = "30000")]
    recv_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pool with monitoring and health checks until Ctrl-C.
    Run {
        #[command(flatten)]
        target: Target,

        /// Also print the Prometheus exposition on shutdown.
        #[arg(long)]
        prometheus: bool,
    },

    /// Run one health check, print it as JSON, exit non-zero when unhealthy.
    Check {
        #[command(flatten)]
        target: Target,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run { target, prometheus } => run(target, prometheus).await,
        Command::Check { target } => check(target).await,
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dbkeeper=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DbKeeperConfig> {
    match path {
        Some(path) => DbKeeperConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let config = DbKeeperConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_pool(target: &Target, config: &DbKeeperConfig) -> ConnectionPool {
    let factory = TcpConnectionFactory::new(
        target.target.clone(),
        Duration::from_millis(target.connect_timeout_ms),
        Duration::from_millis(target.recv_timeout_ms),
    );
    ConnectionPool::new(config.pool.clone(), Arc::new(factory))
}

async fn run(target: Target, prometheus: bool) -> anyhow::Result<()> {
    let config = load_config(target.config.as_deref())?;
    info!(target_addr = %target.target, "dbkeeper daemon starting");

    // ── Initialize components ──────────────────────────────────

    let pool = build_pool(&target, &config);
    pool.initialize()
        .await
        .with_context(|| format!("opening initial connections to {}", target.target))?;

    let cache = Arc::new(QueryCache::new(config.cache.clone())?);
    let optimizer = Arc::new(QueryOptimizer::new(config.optimizer.clone())?);
    let monitor = Arc::new(DatabaseMonitor::new(
        config.monitor.clone(),
        pool.clone(),
        Arc::clone(&cache),
        Arc::clone(&optimizer),
    ));
    let health = Arc::new(HealthChecker::new(config.health.clone(), pool.clone()));

    // ── Start background loops ─────────────────────────────────

    monitor.start(config.monitor.interval()).await;
    health.start_periodic_check(config.health.interval()).await;

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    // ── Shutdown ───────────────────────────────────────────────

    monitor.stop().await;
    health.stop_periodic_check().await;
    monitor.sample().await;
    let report = monitor.export_report().await;
    let exposition = if prometheus {
        Some(monitor.prometheus_text().await)
    } else {
        None
    };
    pool.log_stats().await;
    pool.shutdown().await;

    println!("{report}");
    if let Some(text) = exposition {
        println!("{text}");
    }
    info!("dbkeeper daemon stopped");
    Ok(())
}

async fn check(target: Target) -> anyhow::Result<()> {
    let config = load_config(target.config.as_deref())?;
    let pool = build_pool(&target, &config);
    let checker = HealthChecker::new(config.health.clone(), pool.clone());

    let report = checker.check().await;
    pool.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == dbkeeper_health::HealthStatus::Unhealthy {
        std::process::exit(1);
    }
    Ok(())
}
