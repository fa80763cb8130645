//! Execution Result - tabular output handed to the chart classifier and caller

use crate::connectors::Row;
use serde::{Serialize, Serializer};
use std::time::Duration;

static NULL: serde_json::Value = serde_json::Value::Null;

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Rows from one successful execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Column names in result order
    pub columns: Vec<String>,

    /// Row values keyed by column name
    pub rows: Vec<Row>,

    /// Wall time spent in the connector
    #[serde(serialize_with = "as_millis", rename = "execution_time_ms")]
    pub duration: Duration,

    /// True when the result hit the row limit and more rows may exist
    pub truncated: bool,

    /// Row limit that was enforced
    pub applied_limit: usize,
}

impl ExecutionResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column, in row order. Missing cells read as null.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a serde_json::Value> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&NULL))
    }

    /// Short text used as the answer summary in conversation history.
    pub fn summary(&self) -> String {
        let mut summary = format!("{} row(s)", self.row_count());
        if self.truncated {
            summary.push_str(" (truncated)");
        }
        if let Some(first) = self.rows.first() {
            let preview: Vec<String> = self
                .columns
                .iter()
                .take(4)
                .map(|c| format!("{}={}", c, first.get(c).cloned().unwrap_or_default()))
                .collect();
            summary.push_str(&format!("; first: {}", preview.join(", ")));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(region: &str, total: i64) -> Row {
        let mut r = Row::new();
        r.insert("region".into(), json!(region));
        r.insert("total".into(), json!(total));
        r
    }

    #[test]
    fn test_serializes_duration_as_millis() {
        let result = ExecutionResult {
            columns: vec!["region".into(), "total".into()],
            rows: vec![row("EU", 10)],
            duration: Duration::from_millis(42),
            truncated: false,
            applied_limit: 100,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["execution_time_ms"], json!(42));
        assert_eq!(result.summary(), "1 row(s); first: region=\"EU\", total=10");
    }

    #[test]
    fn test_column_values_fill_missing_with_null() {
        let mut sparse = Row::new();
        sparse.insert("region".into(), json!("US"));
        let result = ExecutionResult {
            columns: vec!["region".into(), "total".into()],
            rows: vec![row("EU", 1), sparse],
            duration: Duration::ZERO,
            truncated: true,
            applied_limit: 2,
        };
        let totals: Vec<_> = result.column_values("total").cloned().collect();
        assert_eq!(totals, vec![json!(1), serde_json::Value::Null]);
        assert!(result.summary().contains("(truncated)"));
    }
}
