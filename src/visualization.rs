//! Visualization Classifier
//!
//! Picks a chart for an execution result from its shape alone. Pure and
//! deterministic: the same result always yields the same recommendation,
//! and anything unclear falls back to a table.
//!
//! Rule order (first match wins):
//! 1. no rows, no columns, or too many columns: table
//! 2. two columns, categorical + numeric, values summing to ~100% (or ~1.0): donut
//! 3. two columns, categorical + numeric: bar
//! 4. two columns, temporal + numeric: area
//! 5. more than two columns, first temporal or categorical, some numeric: line or bar
//! 6. anything else: table

use crate::execution::ExecutionResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    static ref TEMPORAL_COLUMN: Regex = Regex::new(
        r"(?i)(^|_)(date|time|timestamp|datetime|month|year|day|week|quarter|period)($|_)|_at$|_on$"
    )
    .unwrap();
}

const UNIT_NAMES: &[&str] = &["year", "month", "day", "week", "quarter"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Area,
    Donut,
    Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRecommendation {
    pub chart: ChartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ChartRecommendation {
    pub fn table() -> Self {
        Self {
            chart: ChartKind::Table,
            x: None,
            y: None,
            category: None,
            value: None,
        }
    }

    fn axes(chart: ChartKind, x: &str, y: &str) -> Self {
        Self {
            chart,
            x: Some(x.to_string()),
            y: Some(y.to_string()),
            category: None,
            value: None,
        }
    }

    fn donut(category: &str, value: &str) -> Self {
        Self {
            chart: ChartKind::Donut,
            x: None,
            y: None,
            category: Some(category.to_string()),
            value: Some(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Temporal,
    Categorical,
}

pub struct VisualizationClassifier {
    sample_rows: usize,
    max_columns: usize,
    donut_epsilon: f64,
}

impl VisualizationClassifier {
    pub fn new(sample_rows: usize, max_columns: usize, donut_epsilon: f64) -> Self {
        Self {
            sample_rows: sample_rows.max(1),
            max_columns,
            donut_epsilon: donut_epsilon.abs(),
        }
    }

    pub fn recommend(&self, result: &ExecutionResult) -> ChartRecommendation {
        let columns = &result.columns;
        if result.rows.is_empty() || columns.is_empty() || columns.len() > self.max_columns {
            return ChartRecommendation::table();
        }

        let kinds: Vec<ColumnKind> = columns
            .iter()
            .map(|c| self.classify_column(result, c))
            .collect();

        if columns.len() == 2 {
            let numeric = kinds.iter().position(|k| *k == ColumnKind::Numeric);
            let other = kinds.iter().position(|k| *k != ColumnKind::Numeric);
            if let (Some(n), Some(o)) = (numeric, other) {
                let (label, measure) = (&columns[o], &columns[n]);
                match kinds[o] {
                    ColumnKind::Categorical if self.is_proportion(result, measure) => {
                        return ChartRecommendation::donut(label, measure)
                    }
                    ColumnKind::Categorical => {
                        return ChartRecommendation::axes(ChartKind::Bar, label, measure)
                    }
                    ColumnKind::Temporal => {
                        return ChartRecommendation::axes(ChartKind::Area, label, measure)
                    }
                    ColumnKind::Numeric => {}
                }
            }
            return ChartRecommendation::table();
        }

        if columns.len() > 2 {
            let value = kinds
                .iter()
                .skip(1)
                .position(|k| *k == ColumnKind::Numeric)
                .map(|i| &columns[i + 1]);
            if let Some(value) = value {
                match kinds[0] {
                    ColumnKind::Temporal => return ChartRecommendation::axes(ChartKind::Line, &columns[0], value),
                    ColumnKind::Categorical => return ChartRecommendation::axes(ChartKind::Bar, &columns[0], value),
                    ColumnKind::Numeric => {}
                }
            }
        }

        ChartRecommendation::table()
    }

    /// Classify from the first `sample_rows` non-null values.
    pub fn classify_column(&self, result: &ExecutionResult, column: &str) -> ColumnKind {
        let sample: Vec<&Value> = result
            .column_values(column)
            .take(self.sample_rows)
            .filter(|v| !v.is_null())
            .collect();
        if sample.is_empty() {
            return ColumnKind::Categorical;
        }

        if sample.iter().all(|v| v.is_number()) {
            let lowered = column.to_lowercase();
            return if UNIT_NAMES.contains(&lowered.as_str()) {
                ColumnKind::Temporal
            } else {
                ColumnKind::Numeric
            };
        }

        let strings: Option<Vec<&str>> = sample.iter().map(|v| v.as_str()).collect();
        let Some(strings) = strings else {
            return ColumnKind::Categorical;
        };

        if TEMPORAL_COLUMN.is_match(column) || strings.iter().all(|s| parses_as_date(s)) {
            return ColumnKind::Temporal;
        }
        if strings.iter().all(|s| s.trim().parse::<f64>().is_ok()) {
            return ColumnKind::Numeric;
        }
        ColumnKind::Categorical
    }

    fn is_proportion(&self, result: &ExecutionResult, column: &str) -> bool {
        if result.row_count() < 2 {
            return false;
        }
        let mut total = 0.0;
        for value in result.column_values(column) {
            match numeric_value(value) {
                Some(v) if v >= 0.0 => total += v,
                _ => return false,
            }
        }
        (total - 100.0).abs() <= self.donut_epsilon || (total - 1.0).abs() <= self.donut_epsilon / 100.0
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parses_as_date(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || (s.len() == 7 && NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d").is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Row;
    use serde_json::json;
    use std::time::Duration;

    fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> ExecutionResult {
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(values)
                    .collect()
            })
            .collect();
        ExecutionResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            duration: Duration::ZERO,
            truncated: false,
            applied_limit: 1000,
        }
    }

    fn classifier() -> VisualizationClassifier {
        VisualizationClassifier::new(10, 10, 2.0)
    }

    #[test]
    fn test_categorical_numeric_is_bar() {
        let r = result(&["category", "total"], vec![vec![json!("A"), json!(10)], vec![json!("B"), json!(30)]]);
        let rec = classifier().recommend(&r);
        assert_eq!(rec, ChartRecommendation::axes(ChartKind::Bar, "category", "total"));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json, json!({"chart": "bar", "x": "category", "y": "total"}));
    }

    #[test]
    fn test_month_revenue_is_area() {
        let r = result(
            &["month", "revenue"],
            vec![vec![json!("2024-01"), json!(100)], vec![json!("2024-02"), json!(140)]],
        );
        assert_eq!(
            classifier().recommend(&r),
            ChartRecommendation::axes(ChartKind::Area, "month", "revenue")
        );
    }

    #[test]
    fn test_shares_summing_to_hundred_are_donut() {
        let r = result(
            &["channel", "share"],
            vec![
                vec![json!("web"), json!(55.5)],
                vec![json!("store"), json!(30)],
                vec![json!("phone"), json!(15)],
            ],
        );
        assert_eq!(classifier().recommend(&r), ChartRecommendation::donut("channel", "share"));

        let fractions = result(&["channel", "share"], vec![vec![json!("web"), json!(0.6)], vec![json!("store"), json!(0.4)]]);
        assert_eq!(classifier().recommend(&fractions).chart, ChartKind::Donut);
    }

    #[test]
    fn test_wide_results() {
        let r = result(
            &["day", "orders", "revenue"],
            vec![vec![json!("2024-03-01"), json!(4), json!(120.5)]],
        );
        assert_eq!(classifier().recommend(&r), ChartRecommendation::axes(ChartKind::Line, "day", "orders"));

        let r = result(
            &["region", "manager", "revenue"],
            vec![vec![json!("EU"), json!("Ana"), json!("99.10")]],
        );
        assert_eq!(classifier().recommend(&r), ChartRecommendation::axes(ChartKind::Bar, "region", "revenue"));

        let narrow = VisualizationClassifier::new(10, 2, 2.0);
        assert_eq!(narrow.recommend(&r).chart, ChartKind::Table);
    }

    #[test]
    fn test_fallbacks_to_table() {
        assert_eq!(classifier().recommend(&result(&["a", "b"], vec![])).chart, ChartKind::Table);
        let text = result(&["name", "email"], vec![vec![json!("x"), json!("x@y")]]);
        assert_eq!(classifier().recommend(&text).chart, ChartKind::Table);
        let single = result(&["total"], vec![vec![json!(5)]]);
        assert_eq!(classifier().recommend(&single).chart, ChartKind::Table);
    }

    #[test]
    fn test_year_numbers_are_temporal() {
        let r = result(&["year", "total"], vec![vec![json!(2023), json!(7)], vec![json!(2024), json!(9)]]);
        assert_eq!(classifier().recommend(&r), ChartRecommendation::axes(ChartKind::Area, "year", "total"));
    }

    #[test]
    fn test_recommendation_is_idempotent() {
        let r = result(&["category", "total"], vec![vec![json!("A"), json!(10)], vec![json!("B"), json!(30)]]);
        let c = classifier();
        assert_eq!(c.recommend(&r), c.recommend(&r));
    }
}
