//! Local File Connector
//!
//! Uploaded CSV and Parquet files queried with the polars SQL engine. Each
//! file is registered as a table under its configured name; the schema comes
//! straight from the file's column dtypes, so there is no network step.

use super::{
    ConnectionTest, Connector, ConnectorError, ConnectorResult, Dialect, QueryOutput, RawColumn,
    RawSchema, RawTable, Row,
};
use crate::error::FailureKind;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SCHEMA_SAMPLE_ROWS: IdxSize = 1000;

pub struct LocalFileConnector {
    tables: BTreeMap<String, PathBuf>,
}

impl LocalFileConnector {
    pub fn new(tables: BTreeMap<String, PathBuf>) -> ConnectorResult<Self> {
        if tables.is_empty() {
            return Err(ConnectorError::Connection("No files registered for this data source".to_string()));
        }
        for (name, path) in &tables {
            if !path.exists() {
                return Err(ConnectorError::Connection(format!(
                    "File for table {} not found: {}",
                    name,
                    path.display()
                )));
            }
        }
        Ok(Self { tables })
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

fn scan(path: &Path) -> PolarsResult<LazyFrame> {
    let is_parquet = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("parquet"))
        .unwrap_or(false);
    if is_parquet {
        LazyFrame::scan_parquet(path, ScanArgsParquet::default())
    } else {
        LazyCsvReader::new(path)
            .with_has_header(true)
            .with_try_parse_dates(true)
            .with_infer_schema_length(Some(1000))
            .finish()
    }
}

fn map_polars_error(err: PolarsError) -> ConnectorError {
    match err {
        PolarsError::ColumnNotFound(msg) => ConnectorError::Execution {
            reason: format!("column not found: {}", msg),
            kind: FailureKind::UnknownColumn,
        },
        PolarsError::IO { error, .. } => ConnectorError::Connection(format!("Failed to read file: {}", error)),
        other => ConnectorError::execution(other.to_string()),
    }
}

fn run_sql(
    tables: &BTreeMap<String, PathBuf>,
    query: &str,
    limit: usize,
) -> ConnectorResult<DataFrame> {
    let mut ctx = SQLContext::new();
    for (name, path) in tables {
        ctx.register(name, scan(path).map_err(map_polars_error)?);
    }
    ctx.execute(query)
        .and_then(|lf| lf.limit(limit.min(IdxSize::MAX as usize) as IdxSize).collect())
        .map_err(map_polars_error)
}

pub(crate) fn dataframe_rows(df: &DataFrame) -> Vec<Row> {
    let columns = df.get_columns();
    (0..df.height())
        .map(|idx| {
            columns
                .iter()
                .map(|series| {
                    let value = series
                        .get(idx)
                        .map(any_value_to_json)
                        .unwrap_or(serde_json::Value::Null);
                    (series.name().to_string(), value)
                })
                .collect()
        })
        .collect()
}

fn any_value_to_json(value: AnyValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::from(i),
        AnyValue::Int16(i) => Value::from(i),
        AnyValue::Int32(i) => Value::from(i),
        AnyValue::Int64(i) => Value::from(i),
        AnyValue::UInt8(u) => Value::from(u),
        AnyValue::UInt16(u) => Value::from(u),
        AnyValue::UInt32(u) => Value::from(u),
        AnyValue::UInt64(u) => Value::from(u),
        AnyValue::Float32(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::Float64(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        other => Value::String(other.to_string().trim_matches('"').to_string()),
    }
}

#[async_trait]
impl Connector for LocalFileConnector {
    fn dialect(&self) -> Dialect {
        Dialect::LocalFile
    }

    async fn test(&self) -> ConnectionTest {
        let missing: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, path)| !path.exists())
            .map(|(name, _)| name.clone())
            .collect();
        if missing.is_empty() {
            ConnectionTest {
                ok: true,
                message: format!("{} file(s) available", self.tables.len()),
                table_names: self.table_names(),
            }
        } else {
            ConnectionTest::failed(format!("Missing files for: {}", missing.join(", ")))
        }
    }

    async fn introspect(&self) -> ConnectorResult<RawSchema> {
        let tables = self.tables.clone();
        let raw = tokio::task::spawn_blocking(move || -> ConnectorResult<RawSchema> {
            let mut raw_tables = Vec::with_capacity(tables.len());
            for (name, path) in &tables {
                let sample = scan(path)
                    .and_then(|lf| lf.limit(SCHEMA_SAMPLE_ROWS).collect())
                    .map_err(|e| ConnectorError::Introspection(format!("{}: {}", name, e)))?;
                let columns = sample
                    .get_columns()
                    .iter()
                    .map(|series| RawColumn {
                        name: series.name().to_string(),
                        data_type: series.dtype().to_string(),
                        nullable: series.null_count() > 0,
                    })
                    .collect();
                raw_tables.push(RawTable {
                    name: name.clone(),
                    columns,
                    primary_key: Vec::new(),
                    foreign_keys: Vec::new(),
                });
            }
            Ok(RawSchema { tables: raw_tables })
        })
        .await
        .map_err(|e| ConnectorError::Introspection(format!("Introspection task failed: {}", e)))??;
        info!("Introspected {} local file tables", raw.tables.len());
        Ok(raw)
    }

    async fn execute(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> ConnectorResult<QueryOutput> {
        let started = Instant::now();
        let tables = self.tables.clone();
        let sql = query.trim().trim_end_matches(';').to_string();
        // A blocking polars scan cannot be interrupted; on timeout its result is discarded.
        let task = tokio::task::spawn_blocking(move || run_sql(&tables, &sql, limit));
        let df = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined
                .map_err(|e| ConnectorError::execution(format!("Query task failed: {}", e)))??,
            Err(_) => return Err(ConnectorError::Timeout(started.elapsed())),
        };
        let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        let rows = dataframe_rows(&df);
        let duration = started.elapsed();
        debug!("Local file query returned {} rows in {:?}", rows.len(), duration);
        Ok(QueryOutput {
            columns,
            rows,
            duration,
        })
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataframe_rows_keep_column_order() {
        let df = df! {
            "region" => &["EU", "US"],
            "total" => &[10i64, 30],
            "share" => &[0.25f64, 0.75],
        }
        .unwrap();
        let rows = dataframe_rows(&df);
        assert_eq!(rows.len(), 2);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["region", "total", "share"]);
        assert_eq!(rows[1]["total"], serde_json::json!(30));
        assert_eq!(rows[0]["region"], serde_json::json!("EU"));
    }

    #[test]
    fn test_missing_file_rejected() {
        let mut tables = BTreeMap::new();
        tables.insert("sales".to_string(), PathBuf::from("/nonexistent/sales.csv"));
        assert!(matches!(
            LocalFileConnector::new(tables),
            Err(ConnectorError::Connection(_))
        ));
    }

    #[test]
    fn test_column_not_found_is_structured() {
        let err = map_polars_error(PolarsError::ColumnNotFound("revenue".into()));
        assert!(matches!(
            err,
            ConnectorError::Execution {
                kind: FailureKind::UnknownColumn,
                ..
            }
        ));
    }

    #[test]
    fn test_io_error_is_connection_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "sales.csv vanished");
        match map_polars_error(PolarsError::from(io)) {
            ConnectorError::Connection(msg) => assert!(msg.contains("sales.csv vanished"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
