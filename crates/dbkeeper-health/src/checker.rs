//! Health checker: timed pool probe plus a periodic check loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dbkeeper_core::{HealthConfig, as_millis_f64, epoch_millis};
use dbkeeper_pool::ConnectionPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::report::{HealthReport, HealthStatus, classify};

struct CheckTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct HealthChecker {
    config: HealthConfig,
    pool: ConnectionPool,
    started_at: Instant,
    last: Mutex<Option<HealthReport>>,
    task: tokio::sync::Mutex<Option<CheckTask>>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig, pool: ConnectionPool) -> Self {
        Self {
            config,
            pool,
            started_at: Instant::now(),
            last: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Probe the pool with one acquire/release and classify the result.
    ///
    /// The report also replaces the one returned by [`last_health`](Self::last_health).
    pub async fn check(&self) -> HealthReport {
        let started = Instant::now();
        let probe = match self.pool.acquire_timeout(self.config.probe_timeout()).await {
            Ok(handle) => self.pool.release(handle).await.err(),
            Err(e) => Some(e),
        };
        let response_time_ms = as_millis_f64(started.elapsed());
        let stats = self.pool.stats().await;

        let probe_error = probe.map(|e| e.to_string());
        let (status, issues) =
            classify(&self.config, probe_error.as_deref(), response_time_ms, &stats);

        let report = HealthReport {
            status,
            response_time_ms,
            active_connections: stats.busy,
            max_connections: stats.max,
            uptime_secs: self.started_at.elapsed().as_secs(),
            issues,
            checked_at: epoch_millis(),
        };

        match report.status {
            HealthStatus::Healthy => debug!(
                response_time_ms,
                active = report.active_connections,
                "health check passed"
            ),
            status => warn!(
                status = %status,
                response_time_ms,
                issues = report.issues.len(),
                first_issue = report.issues.first().map(|i| i.message.as_str()).unwrap_or(""),
                "health check reported problems"
            ),
        }

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Most recent report, without running a new check.
    pub fn last_health(&self) -> Option<HealthReport> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a fresh check and report whether it came back healthy.
    pub async fn is_healthy(&self) -> bool {
        self.check().await.is_healthy()
    }

    /// Check every `interval` until stopped. A running loop is left untouched.
    pub async fn start_periodic_check(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("periodic health check already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(checker) = weak.upgrade() else {
                            break;
                        };
                        checker.check().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("health checker shutting down");
                        break;
                    }
                }
            }
        });

        *task = Some(CheckTask {
            handle,
            shutdown_tx,
        });
        info!(interval_ms = interval.as_millis() as u64, "periodic health check started");
    }

    /// Stop the periodic loop and wait for it to exit.
    pub async fn stop_periodic_check(&self) {
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.shutdown_tx.send(true);
            let _ = task.handle.await;
            info!("periodic health check stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }
}
