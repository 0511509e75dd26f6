//! dbkeeper-metrics: time series of pool, cache and query metrics.
//!
//! # Architecture
//!
//! ```text
//! DatabaseMonitor
//!   ├── record_query() / record_error()   ← called per executed statement
//!   ├── record_query_latency()            ← feeds the p50/p99 window
//!   ├── sample() → MetricsSnapshot        → bounded history
//!   └── start() → periodic sample loop, stop() ends it
//!
//! Reporting
//!   ├── performance_summary()  averages and peaks over the history
//!   ├── export_report()        fixed-format text
//!   └── render_prometheus()    text/plain exposition of the latest snapshot
//! ```

pub mod monitor;
pub mod prometheus;
pub mod report;

pub use monitor::{DatabaseMonitor, MetricsSnapshot, PerformanceSummary};
pub use prometheus::render_prometheus;
pub use report::format_report;
