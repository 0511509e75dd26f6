//! Database monitor: samples pool, cache and analyzer state into snapshots.
//!
//! Counters fed by the execution path are atomics; the latency window and
//! the snapshot history sit behind short-lived `std::sync::Mutex` locks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dbkeeper_analyzer::QueryOptimizer;
use dbkeeper_cache::QueryCache;
use dbkeeper_core::{MonitorConfig, epoch_millis};
use dbkeeper_pool::ConnectionPool;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::prometheus::render_prometheus;
use crate::report::format_report;

/// Slow shapes listed in the text report.
const REPORT_SLOW_QUERIES: usize = 5;

/// Latency samples kept between snapshots; older ones are dropped first.
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// One sampling cycle's view of the system.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Epoch milliseconds when the sample was taken.
    pub timestamp: u64,
    pub queries_per_second: f64,
    /// Mean recorded execution time reported by the pool.
    pub avg_response_time_ms: f64,
    /// Errors per second over the sampling window.
    pub error_rate: f64,
    /// Busy connections as a percentage of open connections.
    pub connection_utilization: f64,
    /// Cache hit rate in percent.
    pub cache_hit_rate: f64,
    pub slow_query_count: usize,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub waiting_requests: usize,
}

/// Averages and peaks across the retained history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub samples: usize,
    pub avg_queries_per_second: f64,
    pub peak_queries_per_second: f64,
    pub avg_response_time_ms: f64,
    pub peak_response_time_ms: f64,
    pub avg_error_rate: f64,
    pub avg_cache_hit_rate: f64,
}

struct SampleTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodic sampler over the pool, cache and analyzer.
pub struct DatabaseMonitor {
    config: MonitorConfig,
    pool: ConnectionPool,
    cache: Arc<QueryCache>,
    optimizer: Arc<QueryOptimizer>,
    queries: AtomicU64,
    errors: AtomicU64,
    /// Latency samples in microseconds since the last snapshot.
    latencies: Mutex<VecDeque<u64>>,
    last_sample: Mutex<Instant>,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    task: tokio::sync::Mutex<Option<SampleTask>>,
}

impl DatabaseMonitor {
    pub fn new(
        config: MonitorConfig,
        pool: ConnectionPool,
        cache: Arc<QueryCache>,
        optimizer: Arc<QueryOptimizer>,
    ) -> Self {
        Self {
            config,
            pool,
            cache,
            optimizer,
            queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::new()),
            last_sample: Mutex::new(Instant::now()),
            history: Mutex::new(VecDeque::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Count one executed statement.
    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one executed statement and keep its latency for percentiles.
    pub fn record_query_latency(&self, elapsed: Duration) {
        self.record_query();
        let mut latencies = lock(&self.latencies);
        if latencies.len() >= MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(elapsed.as_micros() as u64);
    }

    /// Count one failed statement.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot, reset the per-window counters and append the
    /// snapshot to the history.
    pub async fn sample(&self) -> MetricsSnapshot {
        let pool = self.pool.stats().await;
        let cache = self.cache.stats();
        let slow_query_count = self.optimizer.slow_query_count();

        let elapsed = {
            let mut last = lock(&self.last_sample);
            let now = Instant::now();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed.as_secs_f64()
        };
        let queries = self.queries.swap(0, Ordering::Relaxed);
        let errors = self.errors.swap(0, Ordering::Relaxed);
        let latencies = Vec::from(std::mem::take(&mut *lock(&self.latencies)));
        let (p50, p99) = compute_percentiles(&latencies);

        let per_second = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        let snapshot = MetricsSnapshot {
            timestamp: epoch_millis(),
            queries_per_second: per_second(queries),
            avg_response_time_ms: pool.avg_query_time_ms,
            error_rate: per_second(errors),
            connection_utilization: pool.utilization(),
            cache_hit_rate: cache.hit_rate,
            slow_query_count,
            p50_latency_ms: p50,
            p99_latency_ms: p99,
            active_connections: pool.busy,
            idle_connections: pool.idle,
            waiting_requests: pool.waiting,
        };

        {
            let mut history = lock(&self.history);
            history.push_back(snapshot.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }

        debug!(
            qps = snapshot.queries_per_second,
            error_rate = snapshot.error_rate,
            utilization = snapshot.connection_utilization,
            cache_hit_rate = snapshot.cache_hit_rate,
            slow_queries = snapshot.slow_query_count,
            "metrics snapshot"
        );
        snapshot
    }

    /// Start sampling every `interval`. A running loop is left untouched.
    pub async fn start(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("metrics monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        monitor.sample().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("metrics monitor shutting down");
                        break;
                    }
                }
            }
        });

        *task = Some(SampleTask {
            handle,
            shutdown_tx,
        });
        info!(interval_ms = interval.as_millis() as u64, "metrics monitor started");
    }

    /// Stop the sampling loop and wait for it to exit.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.shutdown_tx.send(true);
            let _ = task.handle.await;
            info!("metrics monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        lock(&self.history).back().cloned()
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let history = lock(&self.history);
        if history.is_empty() {
            return PerformanceSummary::default();
        }
        let n = history.len() as f64;
        let mean = |f: fn(&MetricsSnapshot) -> f64| history.iter().map(f).sum::<f64>() / n;
        let peak = |f: fn(&MetricsSnapshot) -> f64| history.iter().map(f).fold(0.0, f64::max);

        PerformanceSummary {
            samples: history.len(),
            avg_queries_per_second: mean(|s| s.queries_per_second),
            peak_queries_per_second: peak(|s| s.queries_per_second),
            avg_response_time_ms: mean(|s| s.avg_response_time_ms),
            peak_response_time_ms: peak(|s| s.avg_response_time_ms),
            avg_error_rate: mean(|s| s.error_rate),
            avg_cache_hit_rate: mean(|s| s.cache_hit_rate),
        }
    }

    /// Human-readable report of the summary, current pool and cache state,
    /// and the slowest statement shapes.
    pub async fn export_report(&self) -> String {
        let pool = self.pool.stats().await;
        format_report(
            &self.performance_summary(),
            &pool,
            &self.cache.stats(),
            &self.optimizer.slow_queries(REPORT_SLOW_QUERIES),
        )
    }

    /// Prometheus exposition of the latest snapshot and current counters.
    pub async fn prometheus_text(&self) -> String {
        let pool = self.pool.stats().await;
        let snapshot = self.latest().unwrap_or_default();
        render_prometheus(&snapshot, &pool, &self.cache.stats())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// P50 and P99 in milliseconds from microsecond samples; zeros when empty.
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let at = |q: f64| {
        let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
        sorted[idx] as f64 / 1000.0
    };
    (at(0.50), at(0.99))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbkeeper_analyzer::QueryExecution;
    use dbkeeper_core::{CacheConfig, OptimizerConfig, PoolConfig};
    use dbkeeper_pool::{ConnectionBackend, ConnectionFactory};
    use serde_json::json;

    #[derive(Debug)]
    struct NullBackend;

    impl ConnectionBackend for NullBackend {
        fn send(&mut self, data: &[u8]) -> Result<usize, String> {
            Ok(data.len())
        }
        fn recv(&mut self, _max_bytes: usize) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }
        fn ping(&mut self) -> bool {
            true
        }
        fn close(&mut self) {}
    }

    struct NullFactory;

    impl ConnectionFactory for NullFactory {
        fn connect(&self) -> Result<Box<dyn ConnectionBackend>, String> {
            Ok(Box::new(NullBackend))
        }
    }

    fn monitor_with_history(max_history: usize) -> Arc<DatabaseMonitor> {
        let pool = ConnectionPool::new(
            PoolConfig {
                min_connections: 0,
                max_connections: 4,
                acquire_timeout_ms: 100,
                ..PoolConfig::default()
            },
            Arc::new(NullFactory),
        );
        let cache = Arc::new(QueryCache::new(CacheConfig::default()).unwrap());
        let optimizer = Arc::new(QueryOptimizer::new(OptimizerConfig::default()).unwrap());
        Arc::new(DatabaseMonitor::new(
            MonitorConfig {
                interval_ms: 60_000,
                max_history,
            },
            pool,
            cache,
            optimizer,
        ))
    }

    #[test]
    fn percentiles_of_samples() {
        assert_eq!(compute_percentiles(&[]), (0.0, 0.0));
        let samples: Vec<u64> = (1..=100).map(|ms| ms * 1000).collect();
        assert_eq!(compute_percentiles(&samples), (51.0, 100.0));
        assert_eq!(compute_percentiles(&[7000]), (7.0, 7.0));
    }

    #[tokio::test]
    async fn sample_derives_rates_and_resets_counters() {
        let monitor = monitor_with_history(10);
        for _ in 0..20 {
            monitor.record_query();
        }
        monitor.record_error();
        monitor.record_error();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = monitor.sample().await;
        assert!(snap.queries_per_second > 0.0);
        assert!(snap.queries_per_second <= 200.0, "20 queries over >=100ms");
        assert!(snap.error_rate > 0.0 && snap.error_rate <= 20.0);
        assert!((snap.queries_per_second / snap.error_rate - 10.0).abs() < 1e-9);

        let next = monitor.sample().await;
        assert_eq!(next.queries_per_second, 0.0);
        assert_eq!(next.error_rate, 0.0);
    }

    #[tokio::test]
    async fn sample_reads_pool_cache_and_optimizer() {
        let monitor = monitor_with_history(10);
        let held = monitor.pool.acquire().await.unwrap();
        let spare = monitor.pool.acquire().await.unwrap();
        monitor.pool.release(spare).await.unwrap();
        monitor
            .pool
            .record_query(held, Duration::from_millis(40))
            .await
            .unwrap();

        monitor.cache.set("SELECT 1", &[0; 0], json!(1), None);
        monitor.cache.get("SELECT 1", &[0; 0]);
        monitor.cache.get("SELECT 2", &[0; 0]);
        monitor
            .optimizer
            .analyze_query(&QueryExecution::new("SELECT * FROM t", Duration::from_millis(1500)));

        let snap = monitor.sample().await;
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.idle_connections, 1);
        assert_eq!(snap.connection_utilization, 50.0);
        assert_eq!(snap.avg_response_time_ms, 40.0);
        assert_eq!(snap.cache_hit_rate, 50.0);
        assert_eq!(snap.slow_query_count, 1);
    }

    #[tokio::test]
    async fn latency_samples_feed_percentiles() {
        let monitor = monitor_with_history(10);
        for ms in [1, 2, 3, 4, 100] {
            monitor.record_query_latency(Duration::from_millis(ms));
        }
        let snap = monitor.sample().await;
        assert_eq!(snap.p50_latency_ms, 3.0);
        assert_eq!(snap.p99_latency_ms, 100.0);
        assert_eq!(monitor.sample().await.p99_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn latency_window_drops_oldest_samples() {
        let monitor = monitor_with_history(10);
        for _ in 0..5 {
            monitor.record_query_latency(Duration::from_secs(1));
        }
        for _ in 0..MAX_LATENCY_SAMPLES {
            monitor.record_query_latency(Duration::from_millis(1));
        }
        assert_eq!(lock(&monitor.latencies).len(), MAX_LATENCY_SAMPLES);

        let snap = monitor.sample().await;
        assert_eq!(snap.p99_latency_ms, 1.0, "the slow samples were the oldest");
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = monitor_with_history(3);
        for _ in 0..5 {
            monitor.sample().await;
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(monitor.latest(), history.last().cloned());
    }

    #[tokio::test]
    async fn summary_averages_and_peaks() {
        let monitor = monitor_with_history(10);
        {
            let mut history = lock(&monitor.history);
            for (qps, rt) in [(10.0, 5.0), (30.0, 15.0), (20.0, 10.0)] {
                history.push_back(MetricsSnapshot {
                    queries_per_second: qps,
                    avg_response_time_ms: rt,
                    cache_hit_rate: 60.0,
                    error_rate: 0.5,
                    ..MetricsSnapshot::default()
                });
            }
        }

        let summary = monitor.performance_summary();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.avg_queries_per_second, 20.0);
        assert_eq!(summary.peak_queries_per_second, 30.0);
        assert_eq!(summary.avg_response_time_ms, 10.0);
        assert_eq!(summary.peak_response_time_ms, 15.0);
        assert_eq!(summary.avg_error_rate, 0.5);
        assert_eq!(summary.avg_cache_hit_rate, 60.0);
    }

    #[tokio::test]
    async fn summary_of_empty_history_is_zero() {
        let monitor = monitor_with_history(10);
        assert_eq!(monitor.performance_summary(), PerformanceSummary::default());
    }

    #[tokio::test]
    async fn periodic_loop_samples_until_stopped() {
        let monitor = monitor_with_history(100);
        monitor.start(Duration::from_millis(20)).await;
        assert!(monitor.is_running().await);
        tokio::time::sleep(Duration::from_millis(110)).await;
        monitor.stop().await;
        assert!(!monitor.is_running().await);

        let taken = monitor.history().len();
        assert!(taken >= 3, "expected several samples, got {taken}");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(monitor.history().len(), taken, "no samples after stop");
    }

    #[tokio::test]
    async fn report_and_exposition_render() {
        let monitor = monitor_with_history(10);
        monitor.record_query();
        monitor.sample().await;

        let report = monitor.export_report().await;
        assert!(report.contains("PERFORMANCE SUMMARY"));
        let text = monitor.prometheus_text().await;
        assert!(text.contains("# TYPE dbkeeper_queries_per_second gauge"));
    }
}
