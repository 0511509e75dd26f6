//! Health report types and classification rules.

use dbkeeper_core::{HealthConfig, epoch_millis};
use dbkeeper_pool::PoolStats;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Connection,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub message: String,
    /// Epoch milliseconds.
    pub detected_at: u64,
}

impl HealthIssue {
    fn new(kind: IssueKind, severity: IssueSeverity, message: String) -> Self {
        Self {
            kind,
            severity,
            message,
            detected_at: epoch_millis(),
        }
    }
}

/// Result of one health check. Replaced on every check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Time taken by the acquire/release probe.
    pub response_time_ms: f64,
    pub active_connections: usize,
    pub max_connections: usize,
    pub uptime_secs: u64,
    pub issues: Vec<HealthIssue>,
    /// Epoch milliseconds.
    pub checked_at: u64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Apply the threshold rules to one probe.
///
/// `probe_error` is the acquire failure, if any; response-time rules only
/// apply to a probe that got a connection.
pub fn classify(
    config: &HealthConfig,
    probe_error: Option<&str>,
    response_time_ms: f64,
    pool: &PoolStats,
) -> (HealthStatus, Vec<HealthIssue>) {
    let mut issues = Vec::new();

    match probe_error {
        Some(error) => issues.push(HealthIssue::new(
            IssueKind::Connection,
            IssueSeverity::Critical,
            format!("Failed to acquire a connection: {error}"),
        )),
        None => {
            if response_time_ms > config.response_critical_ms as f64 {
                issues.push(HealthIssue::new(
                    IssueKind::Performance,
                    IssueSeverity::Critical,
                    format!("Response time {response_time_ms:.0}ms exceeds {}ms", config.response_critical_ms),
                ));
            } else if response_time_ms > config.response_warning_ms as f64 {
                issues.push(HealthIssue::new(
                    IssueKind::Performance,
                    IssueSeverity::Warning,
                    format!("Response time {response_time_ms:.0}ms exceeds {}ms", config.response_warning_ms),
                ));
            }
        }
    }

    if pool.waiting > config.max_waiting {
        issues.push(HealthIssue::new(
            IssueKind::Connection,
            IssueSeverity::Error,
            format!("{} requests waiting for a connection", pool.waiting),
        ));
    }

    let busy_ratio = pool.busy_ratio();
    if busy_ratio > config.busy_ratio_warning {
        issues.push(HealthIssue::new(
            IssueKind::Connection,
            IssueSeverity::Warning,
            format!(
                "Connection utilization at {:.0}% ({}/{} busy)",
                busy_ratio * 100.0,
                pool.busy,
                pool.total
            ),
        ));
    }

    let status = match issues.iter().map(|i| i.severity).max() {
        Some(IssueSeverity::Critical) => HealthStatus::Unhealthy,
        Some(_) => HealthStatus::Degraded,
        None => HealthStatus::Healthy,
    };
    (status, issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(total: usize, busy: usize, waiting: usize) -> PoolStats {
        PoolStats {
            total,
            busy,
            idle: total - busy,
            waiting,
            max: 20,
            ..PoolStats::default()
        }
    }

    fn severities(issues: &[HealthIssue]) -> Vec<(IssueKind, IssueSeverity)> {
        issues.iter().map(|i| (i.kind, i.severity)).collect()
    }

    #[test]
    fn quiet_pool_is_healthy() {
        let (status, issues) = classify(&HealthConfig::default(), None, 3.0, &pool(5, 1, 0));
        assert_eq!(status, HealthStatus::Healthy);
        assert!(issues.is_empty());
    }

    #[test]
    fn acquire_failure_is_unhealthy() {
        let (status, issues) =
            classify(&HealthConfig::default(), Some("timed out"), 10_000.0, &pool(0, 0, 0));
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(
            severities(&issues),
            vec![(IssueKind::Connection, IssueSeverity::Critical)]
        );
        assert!(issues[0].message.contains("timed out"));
    }

    #[test]
    fn slow_probe_thresholds() {
        let config = HealthConfig::default();
        let (status, issues) = classify(&config, None, 2500.0, &pool(5, 1, 0));
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(
            severities(&issues),
            vec![(IssueKind::Performance, IssueSeverity::Warning)]
        );

        let (status, issues) = classify(&config, None, 5001.0, &pool(5, 1, 0));
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(
            severities(&issues),
            vec![(IssueKind::Performance, IssueSeverity::Critical)]
        );

        let (status, _) = classify(&config, None, 2000.0, &pool(5, 1, 0));
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn long_wait_queue_is_an_error() {
        let (status, issues) = classify(&HealthConfig::default(), None, 1.0, &pool(5, 4, 11));
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(
            severities(&issues),
            vec![(IssueKind::Connection, IssueSeverity::Error)]
        );

        let (status, _) = classify(&HealthConfig::default(), None, 1.0, &pool(5, 4, 10));
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn high_utilization_is_a_warning() {
        let (status, issues) = classify(&HealthConfig::default(), None, 1.0, &pool(20, 19, 0));
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(
            severities(&issues),
            vec![(IssueKind::Connection, IssueSeverity::Warning)]
        );
        assert!(issues[0].message.contains("95%"));

        let (status, _) = classify(&HealthConfig::default(), None, 1.0, &pool(10, 9, 0));
        assert_eq!(status, HealthStatus::Healthy, "exactly 0.9 is not above the limit");
    }

    #[test]
    fn issues_accumulate() {
        let (status, issues) = classify(&HealthConfig::default(), None, 6000.0, &pool(20, 20, 15));
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn thresholds_are_configurable() {
        let config = HealthConfig {
            response_warning_ms: 10,
            response_critical_ms: 50,
            max_waiting: 0,
            ..HealthConfig::default()
        };
        let (status, issues) = classify(&config, None, 20.0, &pool(5, 1, 1));
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn report_serializes_snake_case() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            response_time_ms: 2.5,
            active_connections: 1,
            max_connections: 20,
            uptime_secs: 7,
            issues: vec![HealthIssue::new(
                IssueKind::Performance,
                IssueSeverity::Warning,
                "slow".to_string(),
            )],
            checked_at: 0,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["issues"][0]["kind"], "performance");
        assert_eq!(json["issues"][0]["severity"], "warning");
    }
}
