//! Prometheus text exposition format.
//!
//! Gauges come from the latest snapshot; counters are the pool and cache
//! totals since startup.

use std::fmt::Write;

use dbkeeper_cache::CacheStats;
use dbkeeper_pool::PoolStats;

use crate::monitor::MetricsSnapshot;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP dbkeeper_{name} {help}");
    let _ = writeln!(out, "# TYPE dbkeeper_{name} {kind}");
    let _ = writeln!(out, "dbkeeper_{name} {value}");
}

/// Render the latest snapshot plus pool and cache counters.
pub fn render_prometheus(snapshot: &MetricsSnapshot, pool: &PoolStats, cache: &CacheStats) -> String {
    let mut out = String::new();

    metric(
        &mut out,
        "queries_per_second",
        "gauge",
        "Statements per second over the last sampling window.",
        format!("{:.2}", snapshot.queries_per_second),
    );
    metric(
        &mut out,
        "response_time_avg_ms",
        "gauge",
        "Mean recorded execution time in milliseconds.",
        format!("{:.2}", snapshot.avg_response_time_ms),
    );
    metric(
        &mut out,
        "latency_p50_ms",
        "gauge",
        "P50 statement latency in milliseconds.",
        format!("{:.2}", snapshot.p50_latency_ms),
    );
    metric(
        &mut out,
        "latency_p99_ms",
        "gauge",
        "P99 statement latency in milliseconds.",
        format!("{:.2}", snapshot.p99_latency_ms),
    );
    metric(
        &mut out,
        "errors_per_second",
        "gauge",
        "Failed statements per second over the last sampling window.",
        format!("{:.4}", snapshot.error_rate),
    );
    metric(
        &mut out,
        "connection_utilization_percent",
        "gauge",
        "Busy connections as a percentage of open connections.",
        format!("{:.2}", snapshot.connection_utilization),
    );
    metric(
        &mut out,
        "cache_hit_rate_percent",
        "gauge",
        "Query cache hit rate in percent.",
        format!("{:.2}", snapshot.cache_hit_rate),
    );
    metric(
        &mut out,
        "slow_query_shapes",
        "gauge",
        "Statement shapes above the slow-query threshold.",
        snapshot.slow_query_count,
    );

    metric(&mut out, "pool_connections", "gauge", "Open connections.", pool.total);
    metric(&mut out, "pool_busy_connections", "gauge", "Checked-out connections.", pool.busy);
    metric(&mut out, "pool_waiting_requests", "gauge", "Queued acquire calls.", pool.waiting);
    metric(&mut out, "pool_max_connections", "gauge", "Connection cap.", pool.max);
    metric(
        &mut out,
        "pool_acquire_timeouts_total",
        "counter",
        "Acquire calls that timed out.",
        pool.timeouts,
    );
    metric(
        &mut out,
        "pool_connections_created_total",
        "counter",
        "Connections opened.",
        pool.created,
    );
    metric(&mut out, "cache_entries", "gauge", "Cached results.", cache.entries);
    metric(&mut out, "cache_hits_total", "counter", "Cache hits.", cache.hits);
    metric(&mut out, "cache_misses_total", "counter", "Cache misses.", cache.misses);
    metric(
        &mut out,
        "cache_evictions_total",
        "counter",
        "Entries evicted at capacity.",
        cache.evictions,
    );

    out
}
