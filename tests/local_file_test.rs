mod common;

use common::*;
use polars::prelude::*;
use querylite_engine::schema::SemanticType;
use querylite_engine::visualization::ChartKind;
use querylite_engine::{AskRequest, ConnectionConfig, DataSourceHandle, Dialect, QueryEngine};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Write an orders CSV into a fresh temp directory.
fn create_orders_csv() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("querylite-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;

    let mut orders = df! [
        "id" => [1i64, 2, 3, 4],
        "region" => ["EU", "US", "EU", "APAC"],
        "total" => [100i64, 250, 40, 75],
        "order_date" => ["2024-01-03", "2024-01-05", "2024-02-11", "2024-02-20"]
    ]?;

    let path = dir.join("orders.csv");
    let mut file = std::fs::File::create(&path)?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut orders)?;
    Ok(path)
}

fn local_source(path: PathBuf) -> DataSourceHandle {
    let mut tables = BTreeMap::new();
    tables.insert("orders".to_string(), path);
    DataSourceHandle::connect("uploads", ConnectionConfig::LocalFile { tables }, &test_config()).unwrap()
}

#[tokio::test]
async fn test_local_file_question_end_to_end() {
    let source = local_source(create_orders_csv().unwrap());
    assert_eq!(source.dialect(), Dialect::LocalFile);

    let provider = Arc::new(ScriptedProvider::new([answer(
        "SELECT region, SUM(total) AS total FROM orders GROUP BY region ORDER BY region",
        0.9,
    )]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let response = engine
        .ask(&source, AskRequest::new("total revenue per region"))
        .await
        .unwrap();

    assert_eq!(response.row_count, 3);
    assert_eq!(response.columns, vec!["region".to_string(), "total".to_string()]);
    assert_eq!(response.rows[0]["region"], serde_json::json!("APAC"));
    assert_eq!(response.rows[1]["total"], serde_json::json!(140));
    assert_eq!(response.chart.unwrap().chart, ChartKind::Bar);
    assert!(provider.prompts()[0].contains("Table: orders"));
}

#[tokio::test]
async fn test_local_file_schema_and_connection() {
    let source = local_source(create_orders_csv().unwrap());
    let engine = QueryEngine::new(test_config(), Arc::new(ScriptedProvider::new(Vec::<String>::new()))).unwrap();

    let test = engine.test_connection(&source).await;
    assert!(test.ok);
    assert_eq!(test.table_names, vec!["orders".to_string()]);

    let snapshot = engine.refresh_schema(&source).await.unwrap();
    let orders = snapshot.table("orders").unwrap();
    let kind = |name: &str| {
        orders
            .columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.semantic_type)
            .unwrap()
    };
    assert_eq!(kind("total"), SemanticType::Numeric);
    assert_eq!(kind("order_date"), SemanticType::Temporal);
    assert_eq!(kind("region"), SemanticType::Categorical);
}

#[tokio::test]
async fn test_unknown_column_from_file_source_heals() {
    let source = local_source(create_orders_csv().unwrap());
    let provider = Arc::new(ScriptedProvider::new([
        answer("SELECT regoin, COUNT(*) AS order_count FROM orders GROUP BY regoin", 0.9),
        answer("SELECT region, COUNT(*) AS order_count FROM orders GROUP BY region", 0.9),
    ]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let response = engine
        .ask(&source, AskRequest::new("orders per region"))
        .await
        .unwrap();

    assert!(response.healed);
    assert_eq!(response.row_count, 3);
    assert_eq!(provider.calls(), 2);
}
