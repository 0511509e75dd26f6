//! dbkeeper-health: pool responsiveness probe and health classification.
//!
//! Each check acquires and releases one connection with a bounded wait,
//! then applies threshold rules to the measured time and the pool's
//! counters. Degradation is reported as data; checks never fail.

pub mod checker;
pub mod report;

pub use checker::HealthChecker;
pub use report::{HealthIssue, HealthReport, HealthStatus, IssueKind, IssueSeverity, classify};
