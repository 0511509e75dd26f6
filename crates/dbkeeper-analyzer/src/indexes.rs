//! Index proposals extracted from statement shapes.
//!
//! Best-effort text extraction: the table is the first identifier after
//! `FROM`, the columns are the left-hand sides of comparisons in the
//! `WHERE` clause. Joins, aliases and expressions are not understood.

use regex::Regex;
use serde::Serialize;

use crate::error::{AnalyzerError, compile};

/// A proposed composite index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndexSuggestion {
    pub table: String,
    pub columns: Vec<String>,
    /// Ready-to-run `CREATE INDEX` statement.
    pub statement: String,
}

impl IndexSuggestion {
    fn new(table: String, columns: Vec<String>) -> Self {
        let name = format!("idx_{}_{}", table.replace('.', "_"), columns.join("_"));
        let statement = format!("CREATE INDEX {name} ON {table} ({})", columns.join(", "));
        Self {
            table,
            columns,
            statement,
        }
    }
}

const NOT_COLUMNS: &[&str] = &["and", "or", "not", "null", "is", "where", "between"];

pub(crate) struct IndexExtractor {
    from_table: Regex,
    where_clause: Regex,
    compared_column: Regex,
}

impl IndexExtractor {
    pub(crate) fn new() -> Result<Self, AnalyzerError> {
        Ok(Self {
            from_table: compile("from-table", r"(?i)\bfrom\s+([A-Za-z_][\w]*(?:\.[A-Za-z_][\w]*)?)")?,
            where_clause: compile(
                "where-clause",
                r"(?is)\bwhere\b(.*?)(?:\bgroup\s+by\b|\border\s+by\b|\bhaving\b|\blimit\b|$)",
            )?,
            compared_column: compile(
                "compared-column",
                r"(?i)([A-Za-z_][\w]*(?:\.[A-Za-z_][\w]*)?)\s*(?:<=|>=|<>|!=|=|<|>|\blike\b|\bin\b)",
            )?,
        })
    }

    /// Propose an index for one shape, or `None` when no table or filtered
    /// column can be found.
    pub(crate) fn extract(&self, shape: &str) -> Option<IndexSuggestion> {
        let table = self.from_table.captures(shape)?.get(1)?.as_str().to_string();
        let clause = self.where_clause.captures(shape)?.get(1)?.as_str();

        let mut columns: Vec<String> = Vec::new();
        for caps in self.compared_column.captures_iter(clause) {
            let Some(raw) = caps.get(1) else {
                continue;
            };
            // Drop a table qualifier such as `u.` in `u.email`.
            let column = raw.as_str().rsplit('.').next().unwrap_or(raw.as_str());
            if NOT_COLUMNS.contains(&column.to_ascii_lowercase().as_str()) {
                continue;
            }
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }

        if columns.is_empty() {
            return None;
        }
        Some(IndexSuggestion::new(table, columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(shape: &str) -> Option<IndexSuggestion> {
        IndexExtractor::new().unwrap().extract(shape)
    }

    #[test]
    fn single_equality() {
        let s = extract("SELECT * FROM users WHERE email = ?").unwrap();
        assert_eq!(s.table, "users");
        assert_eq!(s.columns, vec!["email"]);
        assert_eq!(s.statement, "CREATE INDEX idx_users_email ON users (email)");
    }

    #[test]
    fn composite_columns_in_order() {
        let s = extract("SELECT id FROM orders WHERE customer_id = ? AND status <> ? AND total >= ?")
            .unwrap();
        assert_eq!(s.columns, vec!["customer_id", "status", "total"]);
        assert_eq!(
            s.statement,
            "CREATE INDEX idx_orders_customer_id_status_total ON orders (customer_id, status, total)"
        );
    }

    #[test]
    fn clause_stops_at_order_by_and_limit() {
        let s = extract("SELECT * FROM posts WHERE author_id = ? ORDER BY created_at > ? LIMIT ?")
            .unwrap();
        assert_eq!(s.columns, vec!["author_id"]);
    }

    #[test]
    fn qualifiers_are_stripped_and_duplicates_dropped() {
        let s = extract("SELECT * FROM users u WHERE u.org_id = ? OR u.org_id = ?").unwrap();
        assert_eq!(s.columns, vec!["org_id"]);
    }

    #[test]
    fn like_and_in_count_as_comparisons() {
        let s = extract("SELECT * FROM items WHERE name LIKE ? AND kind IN (?,?)").unwrap();
        assert_eq!(s.columns, vec!["name", "kind"]);
    }

    #[test]
    fn schema_qualified_table() {
        let s = extract("SELECT * FROM app.users WHERE id = ?").unwrap();
        assert_eq!(s.table, "app.users");
        assert_eq!(s.statement, "CREATE INDEX idx_app_users_id ON app.users (id)");
    }

    #[test]
    fn no_where_clause_no_suggestion() {
        assert!(extract("SELECT * FROM users").is_none());
        assert!(extract("SELECT ?").is_none());
    }
}
