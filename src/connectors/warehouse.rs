//! Warehouse Connector
//!
//! Trino (and Trino-compatible warehouses) over the REST statement protocol:
//! POST /v1/statement with the SQL as plain text, then follow `nextUri`
//! until the query finishes. Warehouse scans are slower than OLTP lookups,
//! so the default time bound is larger than for relational sources.

use super::{
    ConnectionTest, Connector, ConnectorError, ConnectorResult, Dialect, QueryOutput, RawColumn,
    RawSchema, RawTable, Row,
};
use crate::error::FailureKind;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_POLLS: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WarehouseAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    id: String,
    #[serde(rename = "nextUri")]
    next_uri: Option<String>,
    columns: Option<Vec<StatementColumn>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    message: String,
    #[serde(rename = "errorName")]
    error_name: Option<String>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
}

pub struct WarehouseConnector {
    client: Client,
    coordinator_url: String,
    catalog: String,
    schema: String,
    user: String,
    auth: WarehouseAuth,
}

impl WarehouseConnector {
    pub fn new(
        coordinator_url: String,
        catalog: String,
        schema: String,
        user: String,
        auth: WarehouseAuth,
        request_timeout: Duration,
    ) -> ConnectorResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ConnectorError::Connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
            catalog,
            schema,
            user,
            auth,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Trino-User", &self.user);
        match &self.auth {
            WarehouseAuth::None => request,
            WarehouseAuth::Bearer { token } => request.bearer_auth(token),
            WarehouseAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    fn absolute(&self, uri: &str) -> String {
        if uri.starts_with("http") {
            uri.to_string()
        } else {
            format!("{}{}", self.coordinator_url, uri)
        }
    }

    async fn submit(&self, sql: &str) -> ConnectorResult<StatementResponse> {
        let request = self
            .client
            .post(format!("{}/v1/statement", self.coordinator_url))
            .header("X-Trino-Catalog", &self.catalog)
            .header("X-Trino-Schema", &self.schema)
            .header("Content-Type", "text/plain")
            .body(sql.to_string());
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ConnectorError::Connection(format!("Failed to submit warehouse query: {}", e)))?;
        read_statement(response).await
    }

    /// Follow one `nextUri`, retrying transient failures a few times.
    async fn poll(&self, next_uri: &str) -> ConnectorResult<StatementResponse> {
        let url = self.absolute(next_uri);
        let mut retries = 3;
        loop {
            match self.authorize(self.client.get(&url)).send().await {
                Ok(response) if response.status().is_server_error() && retries > 0 => {
                    retries -= 1;
                    warn!(
                        "Warehouse server error {}, retrying... ({} retries left)",
                        response.status(),
                        retries
                    );
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
                Ok(response) => return read_statement(response).await,
                Err(e) if e.is_timeout() && retries > 0 => {
                    retries -= 1;
                    warn!("Warehouse fetch timeout, retrying... ({} retries left)", retries);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    return Err(ConnectorError::Connection(format!(
                        "Failed to fetch warehouse results: {}",
                        e
                    )))
                }
            }
        }
    }

    /// Ask the coordinator to abandon a query we stopped waiting for. The
    /// DELETE runs on its own task so it completes even if the caller is gone.
    fn cancel(&self, next_uri: &str) {
        let request = self.authorize(self.client.delete(self.absolute(next_uri)));
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => debug!("Warehouse query cancelled ({})", response.status()),
                Err(e) => warn!("Failed to cancel warehouse query: {}", e),
            }
        });
    }

    async fn run(&self, sql: &str, limit: usize, timeout: Duration) -> ConnectorResult<QueryOutput> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut response = match tokio::time::timeout_at(deadline, self.submit(sql)).await {
            Ok(response) => response?,
            Err(_) => return Err(ConnectorError::Timeout(started.elapsed())),
        };
        let query_id = response.id.clone();
        debug!("Warehouse query submitted: {}", query_id);

        let mut columns: Option<Vec<StatementColumn>> = None;
        let mut data: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut poll_count = 0usize;

        loop {
            if columns.is_none() {
                columns = response.columns.take();
            }
            if let Some(chunk) = response.data.take() {
                data.extend(chunk);
            }
            let Some(next_uri) = response.next_uri.take() else { break };

            if data.len() >= limit {
                self.cancel(&next_uri);
                break;
            }
            poll_count += 1;
            if poll_count > MAX_POLLS {
                self.cancel(&next_uri);
                return Err(ConnectorError::execution(format!(
                    "Warehouse query exceeded max polls ({})",
                    MAX_POLLS
                )));
            }

            let delay = Duration::from_millis((50 * poll_count.min(10)) as u64);
            let next = tokio::time::timeout_at(deadline, async {
                tokio::time::sleep(delay).await;
                self.poll(&next_uri).await
            })
            .await;
            response = match next {
                Ok(response) => response?,
                Err(_) => {
                    warn!("Warehouse query {} exceeded {:?}, cancelling", query_id, timeout);
                    self.cancel(&next_uri);
                    return Err(ConnectorError::Timeout(started.elapsed()));
                }
            };
        }

        let columns = columns.unwrap_or_default();
        let rows: Vec<Row> = data
            .into_iter()
            .take(limit)
            .map(|values| {
                columns
                    .iter()
                    .zip(values.into_iter().chain(std::iter::repeat(serde_json::Value::Null)))
                    .map(|(column, value)| (column.name.clone(), value))
                    .collect()
            })
            .collect();

        Ok(QueryOutput {
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            duration: started.elapsed(),
        })
    }
}

async fn read_statement(response: reqwest::Response) -> ConnectorResult<StatementResponse> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ConnectorError::Connection(format!(
            "Warehouse rejected credentials ({})",
            status
        )));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ConnectorError::Connection(format!(
            "Warehouse request failed with status {}: {}",
            status, text
        )));
    }
    let parsed: StatementResponse = response
        .json()
        .await
        .map_err(|e| ConnectorError::execution(format!("Failed to parse warehouse response: {}", e)))?;
    if let Some(error) = &parsed.error {
        return Err(ConnectorError::Execution {
            reason: error.message.clone(),
            kind: failure_kind_for_error(error),
        });
    }
    Ok(parsed)
}

fn failure_kind_for_error(error: &StatementError) -> FailureKind {
    // Only user errors are about the query text itself.
    if matches!(error.error_type.as_deref(), Some("INTERNAL_ERROR" | "EXTERNAL" | "INSUFFICIENT_RESOURCES")) {
        return FailureKind::Other;
    }
    match error.error_name.as_deref().unwrap_or_default() {
        "COLUMN_NOT_FOUND" | "MISSING_COLUMN_NAME" => FailureKind::UnknownColumn,
        "TABLE_NOT_FOUND" | "MISSING_TABLE" | "SCHEMA_NOT_FOUND" | "CATALOG_NOT_FOUND" => {
            FailureKind::UnknownTable
        }
        "AMBIGUOUS_NAME" => FailureKind::AmbiguousColumn,
        "SYNTAX_ERROR" => FailureKind::Syntax,
        "MISSING_GROUP_BY" | "EXPRESSION_NOT_AGGREGATE" | "EXPRESSION_NOT_IN_DISTINCT" => {
            FailureKind::InvalidAggregation
        }
        "PERMISSION_DENIED" => FailureKind::Permission,
        _ => FailureKind::Other,
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl Connector for WarehouseConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Warehouse
    }

    async fn test(&self) -> ConnectionTest {
        let sql = format!(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = {} ORDER BY table_name",
            sql_literal(&self.schema)
        );
        match self.run(&sql, 10_000, Duration::from_secs(30)).await {
            Ok(output) => {
                let table_names: Vec<String> = output
                    .rows
                    .iter()
                    .filter_map(|row| row.get("table_name").and_then(|v| v.as_str()).map(String::from))
                    .collect();
                ConnectionTest {
                    ok: true,
                    message: format!("Connected to {}.{}", self.catalog, self.schema),
                    table_names,
                }
            }
            Err(e) => {
                warn!("Warehouse health check failed: {}", e);
                ConnectionTest::failed(format!("Connection failed: {}", e))
            }
        }
    }

    async fn introspect(&self) -> ConnectorResult<RawSchema> {
        let sql = format!(
            "SELECT table_name, column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = {} ORDER BY table_name, ordinal_position",
            sql_literal(&self.schema)
        );
        let output = self
            .run(&sql, usize::MAX, Duration::from_secs(120))
            .await
            .map_err(|e| ConnectorError::Introspection(e.to_string()))?;

        let mut tables: BTreeMap<String, RawTable> = BTreeMap::new();
        for row in &output.rows {
            let field = |name: &str| row.get(name).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let table = field("table_name");
            tables
                .entry(table.clone())
                .or_insert_with(|| RawTable {
                    name: table,
                    ..RawTable::default()
                })
                .columns
                .push(RawColumn {
                    name: field("column_name"),
                    data_type: field("data_type"),
                    nullable: field("is_nullable") != "NO",
                });
        }
        info!("Introspected {} warehouse tables in {}.{}", tables.len(), self.catalog, self.schema);
        Ok(RawSchema {
            tables: tables.into_values().collect(),
        })
    }

    async fn execute(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> ConnectorResult<QueryOutput> {
        self.run(query.trim().trim_end_matches(';'), limit, timeout).await
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(name: &str) -> StatementError {
        StatementError {
            message: "boom".into(),
            error_name: Some(name.into()),
            error_type: Some("USER_ERROR".into()),
        }
    }

    #[test]
    fn test_error_names_map_to_failure_kinds() {
        assert_eq!(failure_kind_for_error(&error("COLUMN_NOT_FOUND")), FailureKind::UnknownColumn);
        assert_eq!(failure_kind_for_error(&error("TABLE_NOT_FOUND")), FailureKind::UnknownTable);
        assert_eq!(failure_kind_for_error(&error("MISSING_GROUP_BY")), FailureKind::InvalidAggregation);
        assert_eq!(failure_kind_for_error(&error("GENERIC_INTERNAL_ERROR")), FailureKind::Other);
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(sql_literal("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_statement_response_parses() {
        let body = r#"{"id":"q1","nextUri":null,"columns":[{"name":"n","type":"bigint"}],"data":[[1],[2]]}"#;
        let parsed: StatementResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.id, "q1");
        assert_eq!(parsed.columns.unwrap()[0].column_type, "bigint");
        assert_eq!(parsed.data.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_cancels_running_query() {
        use crate::connectors::DataSourceHandle;
        use crate::execution::Executor;
        use crate::safety::{LimitStrategy, ValidatedQuery};
        use axum::{http::StatusCode, routing::{get, post}, Json, Router};
        use std::sync::Arc;
        use tokio::sync::Notify;

        // Coordinator that accepts the query and then never finishes it.
        let cancelled = Arc::new(Notify::new());
        let on_delete = Arc::clone(&cancelled);
        let app = Router::new()
            .route(
                "/v1/statement",
                post(|| async { Json(serde_json::json!({"id": "q1", "nextUri": "/v1/statement/executing/q1/1"})) }),
            )
            .route(
                "/v1/statement/executing/q1/1",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Json(serde_json::json!({"id": "q1"}))
                })
                .delete(move || {
                    let on_delete = Arc::clone(&on_delete);
                    async move {
                        on_delete.notify_one();
                        StatusCode::NO_CONTENT
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let connector = WarehouseConnector::new(
            format!("http://{}", addr),
            "hive".into(),
            "sales".into(),
            "analyst".into(),
            WarehouseAuth::None,
            Duration::from_secs(60),
        )
        .unwrap();
        let handle = DataSourceHandle::from_connector("warehouse", Arc::new(connector), 1, Duration::from_secs(120));
        let query = ValidatedQuery {
            text: "SELECT region FROM orders LIMIT 11".into(),
            dialect: Dialect::Warehouse,
            applied_limit: 10,
            limit_strategy: LimitStrategy::Appended,
        };

        let err = Executor::new(Duration::from_secs(1))
            .run(&handle, &query, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout(_)));
        assert_eq!(handle.available_slots(), 1);
        tokio::time::timeout(Duration::from_secs(5), cancelled.notified())
            .await
            .expect("coordinator never received the cancel");
    }
}
