//! dbkeeper-analyzer: heuristic analysis of executed statements.
//!
//! Nothing here parses SQL. Suggestions come from text patterns and the
//! metrics the caller reports for each execution; statistics are grouped by
//! statement *shape* (literals replaced with `?`).
//!
//! ```text
//! analyze_query(execution)
//!   → normalize_shape(sql)          literals → ?
//!   → update QueryStats for shape   count, total, avg, min, max
//!   → severity from timing/index    Low | Medium | High | Critical
//!   → pattern suggestions           SELECT *, LIKE '%…', OR chains, sub-selects
//! ```

pub mod analyzer;
pub mod error;
pub mod indexes;
pub mod shape;

pub use analyzer::{QueryAnalysis, QueryExecution, QueryOptimizer, QueryStats, Severity};
pub use error::AnalyzerError;
pub use indexes::IndexSuggestion;
pub use shape::normalize_shape;
