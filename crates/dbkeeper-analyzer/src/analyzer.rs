//! Per-execution analysis and rolling per-shape statistics.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dbkeeper_core::{OptimizerConfig, as_millis_f64, epoch_millis};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AnalyzerError, compile};
use crate::indexes::{IndexExtractor, IndexSuggestion};
use crate::shape::normalize_shape;

const CRITICAL_MS: f64 = 5000.0;
const HIGH_MS: f64 = 2000.0;
const MEDIUM_MS: f64 = 1000.0;
/// Rows examined per row returned above which the filter is flagged.
const SCAN_RATIO_LIMIT: f64 = 100.0;
/// `OR` conditions tolerated before suggesting `IN`/`UNION`.
const MAX_OR_CONDITIONS: usize = 3;

/// Metrics reported by the caller for one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExecution {
    pub sql: String,
    pub execution_time: Duration,
    pub rows_examined: u64,
    pub rows_returned: u64,
    pub index_used: bool,
    pub index_name: Option<String>,
}

impl QueryExecution {
    pub fn new(sql: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            sql: sql.into(),
            execution_time,
            rows_examined: 0,
            rows_returned: 0,
            index_used: true,
            index_name: None,
        }
    }

    pub fn rows(mut self, examined: u64, returned: u64) -> Self {
        self.rows_examined = examined;
        self.rows_returned = returned;
        self
    }

    pub fn without_index(mut self) -> Self {
        self.index_used = false;
        self.index_name = None;
        self
    }

    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.index_used = true;
        self.index_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn from_elapsed_ms(ms: f64) -> Self {
        if ms > CRITICAL_MS {
            Severity::Critical
        } else if ms > HIGH_MS {
            Severity::High
        } else if ms > MEDIUM_MS {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Advisory result of [`QueryOptimizer::analyze_query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnalysis {
    pub shape: String,
    pub severity: Severity,
    pub suggestions: Vec<String>,
}

/// Rolling statistics for one statement shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStats {
    pub shape: String,
    pub execution_count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    /// Epoch milliseconds of the latest execution.
    pub last_executed: u64,
}

impl QueryStats {
    fn first(shape: String, elapsed_ms: f64) -> Self {
        Self {
            shape,
            execution_count: 1,
            total_time_ms: elapsed_ms,
            avg_time_ms: elapsed_ms,
            min_time_ms: elapsed_ms,
            max_time_ms: elapsed_ms,
            last_executed: epoch_millis(),
        }
    }

    fn record(&mut self, elapsed_ms: f64) {
        self.execution_count += 1;
        self.total_time_ms += elapsed_ms;
        self.avg_time_ms = self.total_time_ms / self.execution_count as f64;
        self.min_time_ms = self.min_time_ms.min(elapsed_ms);
        self.max_time_ms = self.max_time_ms.max(elapsed_ms);
        self.last_executed = epoch_millis();
    }
}

struct Patterns {
    select_star: Regex,
    leading_wildcard: Regex,
    or_condition: Regex,
    sub_select: Regex,
}

/// Heuristic statement analyzer with per-shape statistics.
///
/// Safe to share behind an `Arc`; statistics live behind one mutex held
/// only for map updates.
pub struct QueryOptimizer {
    config: OptimizerConfig,
    patterns: Patterns,
    indexes: IndexExtractor,
    stats: Mutex<HashMap<String, QueryStats>>,
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self, AnalyzerError> {
        Ok(Self {
            config,
            patterns: Patterns {
                select_star: compile("select-star", r"(?i)\bselect\s+\*")?,
                leading_wildcard: compile("leading-wildcard", r"(?i)\blike\s+'%")?,
                or_condition: compile("or-condition", r"(?i)\bor\b")?,
                sub_select: compile("sub-select", r"(?i)\(\s*select\b")?,
            },
            indexes: IndexExtractor::new()?,
            stats: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Analyze one execution and fold it into the statistics for its shape.
    ///
    /// Pattern checks run against the raw statement so literal-dependent
    /// patterns such as `LIKE '%…'` are still visible.
    pub fn analyze_query(&self, execution: &QueryExecution) -> QueryAnalysis {
        let shape = normalize_shape(&execution.sql);
        let elapsed_ms = as_millis_f64(execution.execution_time);
        self.record(&shape, elapsed_ms);

        let mut severity = Severity::from_elapsed_ms(elapsed_ms);
        let mut suggestions = Vec::new();

        if elapsed_ms > MEDIUM_MS {
            suggestions.push(format!(
                "Query took {elapsed_ms:.0}ms; consider optimizing it or caching its result"
            ));
        }

        if !execution.index_used {
            severity = severity.max(Severity::Medium);
            suggestions.push(
                "No index was used; consider adding an index on the filtered columns".to_string(),
            );
        }

        if execution.rows_examined > 0 {
            let ratio = execution.rows_examined as f64 / execution.rows_returned.max(1) as f64;
            if ratio > SCAN_RATIO_LIMIT {
                suggestions.push(format!(
                    "Examined {} rows to return {}; the filter is not selective enough",
                    execution.rows_examined, execution.rows_returned
                ));
            }
        }

        let sql = execution.sql.as_str();
        if self.patterns.select_star.is_match(sql) {
            suggestions.push("Avoid SELECT *; list only the columns you need".to_string());
        }
        if self.patterns.leading_wildcard.is_match(sql) {
            suggestions
                .push("LIKE with a leading wildcard cannot use an index".to_string());
        }
        let or_count = self.patterns.or_condition.find_iter(sql).count();
        if or_count > MAX_OR_CONDITIONS {
            suggestions.push(format!(
                "{or_count} OR conditions; consider IN (...) or UNION instead"
            ));
        }
        if self.patterns.sub_select.is_match(sql) {
            suggestions.push("Nested SELECT; consider rewriting it as a JOIN".to_string());
        }

        if severity >= Severity::High {
            warn!(
                shape = %shape,
                elapsed_ms,
                severity = %severity,
                index = execution.index_name.as_deref().unwrap_or("-"),
                "slow query"
            );
        } else {
            debug!(
                shape = %shape,
                elapsed_ms,
                severity = %severity,
                suggestions = suggestions.len(),
                "analyzed query"
            );
        }

        QueryAnalysis {
            shape,
            severity,
            suggestions,
        }
    }

    /// Shapes whose average time exceeds the slow-query threshold, slowest first.
    pub fn slow_queries(&self, limit: usize) -> Vec<QueryStats> {
        let threshold = self.config.slow_query_threshold_ms;
        let mut slow: Vec<QueryStats> = self
            .lock()
            .values()
            .filter(|s| s.avg_time_ms > threshold)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.avg_time_ms.total_cmp(&a.avg_time_ms));
        slow.truncate(limit);
        slow
    }

    pub fn slow_query_count(&self) -> usize {
        let threshold = self.config.slow_query_threshold_ms;
        self.lock()
            .values()
            .filter(|s| s.avg_time_ms > threshold)
            .count()
    }

    /// Shapes ordered by execution count, most frequent first.
    pub fn most_frequent_queries(&self, limit: usize) -> Vec<QueryStats> {
        let mut all: Vec<QueryStats> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            b.execution_count
                .cmp(&a.execution_count)
                .then_with(|| a.shape.cmp(&b.shape))
        });
        all.truncate(limit);
        all
    }

    /// Composite index proposals for every slow shape, de-duplicated.
    pub fn suggest_indexes(&self) -> Vec<IndexSuggestion> {
        let mut seen = HashSet::new();
        self.slow_queries(usize::MAX)
            .iter()
            .filter_map(|stats| self.indexes.extract(&stats.shape))
            .filter(|s| seen.insert((s.table.clone(), s.columns.clone())))
            .collect()
    }

    pub fn stats_for(&self, shape: &str) -> Option<QueryStats> {
        self.lock().get(shape).cloned()
    }

    pub fn shape_count(&self) -> usize {
        self.lock().len()
    }

    /// Forget all statistics.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn record(&self, shape: &str, elapsed_ms: f64) {
        let mut stats = self.lock();
        match stats.get_mut(shape) {
            Some(entry) => entry.record(elapsed_ms),
            None => {
                stats.insert(shape.to_string(), QueryStats::first(shape.to_string(), elapsed_ms));
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueryStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
