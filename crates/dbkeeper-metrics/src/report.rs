//! Human-readable report formatting.

use dbkeeper_analyzer::QueryStats;
use dbkeeper_cache::CacheStats;
use dbkeeper_pool::PoolStats;

use crate::monitor::PerformanceSummary;

pub fn format_report(
    summary: &PerformanceSummary,
    pool: &PoolStats,
    cache: &CacheStats,
    slow_queries: &[QueryStats],
) -> String {
    let mut out = String::new();

    out.push_str("\n╔══════════════════════════════════════════╗\n");
    out.push_str("║  dbkeeper Performance Report             ║\n");
    out.push_str("╚══════════════════════════════════════════╝\n\n");

    out.push_str(&format!("PERFORMANCE SUMMARY ({} samples):\n", summary.samples));
    out.push_str(&format!(
        "  Queries/sec:    avg {:.2}, peak {:.2}\n",
        summary.avg_queries_per_second, summary.peak_queries_per_second
    ));
    out.push_str(&format!(
        "  Response time:  avg {:.2}ms, peak {:.2}ms\n",
        summary.avg_response_time_ms, summary.peak_response_time_ms
    ));
    out.push_str(&format!("  Error rate:     {:.4}/s\n", summary.avg_error_rate));
    out.push_str(&format!("  Cache hit rate: {:.2}%\n\n", summary.avg_cache_hit_rate));

    out.push_str("CONNECTION POOL:\n");
    out.push_str(&format!(
        "  Connections:    {} open ({} busy, {} idle), max {}\n",
        pool.total, pool.busy, pool.idle, pool.max
    ));
    out.push_str(&format!("  Waiting:        {}\n", pool.waiting));
    out.push_str(&format!(
        "  Queries:        {} (avg {:.2}ms)\n",
        pool.total_queries, pool.avg_query_time_ms
    ));
    out.push_str(&format!(
        "  Waits:          {} queued, {} timed out\n\n",
        pool.wait_count, pool.timeouts
    ));

    out.push_str("QUERY CACHE:\n");
    out.push_str(&format!(
        "  Entries:        {} ({} bytes)\n",
        cache.entries, cache.total_size_bytes
    ));
    out.push_str(&format!(
        "  Hits/misses:    {}/{} ({:.2}%)\n",
        cache.hits, cache.misses, cache.hit_rate
    ));
    out.push_str(&format!("  Evictions:      {}\n\n", cache.evictions));

    if slow_queries.is_empty() {
        out.push_str("SLOW QUERIES: none\n");
    } else {
        out.push_str("SLOW QUERIES:\n\n");
        for (i, q) in slow_queries.iter().enumerate() {
            out.push_str(&format!("  {}. {}\n", i + 1, q.shape));
            out.push_str(&format!(
                "     avg {:.2}ms, max {:.2}ms, {} executions\n",
                q.avg_time_ms, q.max_time_ms, q.execution_count
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow(shape: &str, avg: f64) -> QueryStats {
        QueryStats {
            shape: shape.to_string(),
            execution_count: 4,
            total_time_ms: avg * 4.0,
            avg_time_ms: avg,
            min_time_ms: avg,
            max_time_ms: avg * 2.0,
            last_executed: 0,
        }
    }

    #[test]
    fn report_has_every_section() {
        let report = format_report(
            &PerformanceSummary {
                samples: 3,
                avg_queries_per_second: 12.5,
                peak_queries_per_second: 20.0,
                ..PerformanceSummary::default()
            },
            &PoolStats {
                total: 5,
                busy: 2,
                idle: 3,
                max: 20,
                ..PoolStats::default()
            },
            &CacheStats {
                hits: 3,
                misses: 1,
                hit_rate: 75.0,
                ..CacheStats::default()
            },
            &[slow("SELECT * FROM t WHERE id = ?", 1500.0)],
        );

        assert!(report.contains("PERFORMANCE SUMMARY (3 samples):"));
        assert!(report.contains("avg 12.50, peak 20.00"));
        assert!(report.contains("5 open (2 busy, 3 idle), max 20"));
        assert!(report.contains("3/1 (75.00%)"));
        assert!(report.contains("1. SELECT * FROM t WHERE id = ?"));
        assert!(report.contains("avg 1500.00ms, max 3000.00ms, 4 executions"));
    }

    #[test]
    fn report_without_slow_queries() {
        let report = format_report(
            &PerformanceSummary::default(),
            &PoolStats::default(),
            &CacheStats::default(),
            &[],
        );
        assert!(report.contains("SLOW QUERIES: none"));
        assert!(report.contains("CONNECTION POOL:"));
        assert!(report.contains("QUERY CACHE:"));
    }
}
