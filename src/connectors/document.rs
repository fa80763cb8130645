//! Document Connector
//!
//! MongoDB collections reached through the Atlas Data API. Queries are a
//! structured JSON description rather than SQL text:
//!
//! ```json
//! {"collection": "orders", "filter": {"status": "paid"}, "sort": {"total": -1}, "limit": 50}
//! {"collection": "orders", "pipeline": [{"$group": {"_id": "$region", "n": {"$sum": 1}}}]}
//! ```

use super::{
    columns_of, ConnectionTest, Connector, ConnectorError, ConnectorResult, Dialect, QueryOutput,
    RawColumn, RawSchema, RawTable, Row,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_FIND_LIMIT: u64 = 100;
const SCHEMA_SAMPLE_SIZE: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct DocumentsResponse {
    #[serde(default)]
    documents: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DataApiError {
    error: Option<String>,
    error_code: Option<String>,
}

pub struct DocumentConnector {
    client: Client,
    endpoint: String,
    api_key: String,
    data_source: String,
    database: String,
    collections: Vec<String>,
}

impl DocumentConnector {
    pub fn new(
        endpoint: String,
        api_key: String,
        data_source: String,
        database: String,
        collections: Vec<String>,
    ) -> ConnectorResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectorError::Connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            data_source,
            database,
            collections,
        })
    }

    async fn action(&self, action: &str, mut body: Value, timeout: Duration) -> ConnectorResult<Vec<Value>> {
        body["dataSource"] = json!(self.data_source);
        body["database"] = json!(self.database);

        let response = self
            .client
            .post(format!("{}/action/{}", self.endpoint, action))
            .header("api-key", &self.api_key)
            .header("Accept", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout(timeout)
                } else {
                    ConnectorError::Connection(format!("Data API request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<DataApiError>(&text)
                .ok()
                .and_then(|e| match (e.error, e.error_code) {
                    (Some(msg), Some(code)) => Some(format!("{} ({})", msg, code)),
                    (Some(msg), None) => Some(msg),
                    _ => None,
                })
                .unwrap_or(text);
            if status.is_server_error() || status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ConnectorError::Connection(format!(
                    "Data API returned {}: {}",
                    status, reason
                )));
            }
            return Err(ConnectorError::execution(reason));
        }

        let parsed: DocumentsResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::execution(format!("Failed to parse Data API response: {}", e)))?;
        Ok(parsed.documents)
    }

    async fn sample(&self, collection: &str, size: u64, timeout: Duration) -> ConnectorResult<Vec<Value>> {
        self.action(
            "find",
            json!({ "collection": collection, "filter": {}, "limit": size }),
            timeout,
        )
        .await
    }
}

#[async_trait]
impl Connector for DocumentConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Document
    }

    async fn test(&self) -> ConnectionTest {
        let Some(first) = self.collections.first() else {
            return ConnectionTest::failed("No collections configured for this data source");
        };
        match self.sample(first, 1, Duration::from_secs(10)).await {
            Ok(_) => ConnectionTest {
                ok: true,
                message: format!("Connected to database {}", self.database),
                table_names: self.collections.clone(),
            },
            Err(e) => {
                warn!("Document source health check failed: {}", e);
                ConnectionTest::failed(format!("Connection failed: {}", e))
            }
        }
    }

    async fn introspect(&self) -> ConnectorResult<RawSchema> {
        let mut tables = Vec::with_capacity(self.collections.len());
        for collection in &self.collections {
            let documents = self
                .sample(collection, SCHEMA_SAMPLE_SIZE, Duration::from_secs(30))
                .await
                .map_err(|e| ConnectorError::Introspection(format!("{}: {}", collection, e)))?;
            tables.push(infer_collection_shape(collection, &documents));
        }
        Ok(RawSchema { tables })
    }

    async fn execute(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> ConnectorResult<QueryOutput> {
        let parsed: DocumentQuery = serde_json::from_str(query)
            .map_err(|e| ConnectorError::execution(format!("Malformed document query: {}", e)))?;
        let started = Instant::now();

        let documents = match &parsed.pipeline {
            Some(pipeline) => {
                self.action(
                    "aggregate",
                    json!({ "collection": parsed.collection, "pipeline": pipeline }),
                    timeout,
                )
                .await?
            }
            None => {
                let mut body = json!({
                    "collection": parsed.collection,
                    "filter": parsed.filter.clone().unwrap_or_else(|| json!({})),
                    "limit": parsed.limit.unwrap_or(DEFAULT_FIND_LIMIT).min(limit as u64),
                });
                if let Some(projection) = &parsed.projection {
                    body["projection"] = projection.clone();
                }
                if let Some(sort) = &parsed.sort {
                    body["sort"] = sort.clone();
                }
                self.action("find", body, timeout).await?
            }
        };

        let rows: Vec<Row> = documents
            .into_iter()
            .take(limit)
            .map(|doc| match unwrap_extended_json(doc) {
                Value::Object(map) => map,
                other => {
                    let mut row = Row::new();
                    row.insert("value".to_string(), other);
                    row
                }
            })
            .collect();
        let duration = started.elapsed();
        debug!("Document query on {} returned {} rows", parsed.collection, rows.len());
        Ok(QueryOutput {
            columns: columns_of(&rows),
            rows,
            duration,
        })
    }

    async fn close(&self) {}
}

/// Collapse extended JSON wrappers such as `{"$oid": ".."}` or `{"$date": ..}` to plain values.
fn unwrap_extended_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if key.starts_with('$') {
                        return match inner {
                            Value::String(s) => s
                                .parse::<i64>()
                                .ok()
                                .filter(|_| key == "$numberLong" || key == "$numberInt")
                                .map(Value::from)
                                .or_else(|| {
                                    s.parse::<f64>()
                                        .ok()
                                        .filter(|_| key == "$numberDouble" || key == "$numberDecimal")
                                        .map(Value::from)
                                })
                                .unwrap_or_else(|| Value::String(s.clone())),
                            other => other.clone(),
                        };
                    }
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, unwrap_extended_json(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(unwrap_extended_json).collect()),
        other => other,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(s) if looks_like_date(s) => "date",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn looks_like_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// Derive a column list from sampled documents; a field missing from any sample is nullable.
fn infer_collection_shape(collection: &str, documents: &[Value]) -> RawTable {
    let mut fields: BTreeMap<String, (Option<&'static str>, usize, bool)> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    let flattened: Vec<Value> = documents.iter().cloned().map(unwrap_extended_json).collect();
    for doc in &flattened {
        let Value::Object(map) = doc else { continue };
        for (key, value) in map {
            let entry = fields.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                (None, 0, false)
            });
            entry.1 += 1;
            match json_type_name(value) {
                "null" => entry.2 = true,
                ty => {
                    entry.0 = match entry.0 {
                        None => Some(ty),
                        Some(existing) if existing == ty => Some(existing),
                        Some(_) => Some("mixed"),
                    }
                }
            }
        }
    }

    let columns = order
        .into_iter()
        .filter_map(|name| {
            fields.get(&name).map(|(ty, seen, saw_null)| RawColumn {
                data_type: ty.unwrap_or("null").to_string(),
                nullable: *saw_null || *seen < flattened.len(),
                name,
            })
        })
        .collect();

    RawTable {
        name: collection.to_string(),
        columns,
        primary_key: vec!["_id".to_string()],
        foreign_keys: Vec::new(),
    }
}
