#![allow(dead_code)]

use async_trait::async_trait;
use querylite_engine::connectors::{
    ConnectionTest, Connector, ConnectorError, ConnectorResult, Dialect, QueryOutput, RawColumn,
    RawSchema, RawTable, Row,
};
use querylite_engine::error::{EngineError, Result};
use querylite_engine::llm::{Completion, LlmProvider, TokenUsage};
use querylite_engine::observability::{AuditEvent, AuditSink};
use querylite_engine::{DataSourceHandle, EngineConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Responder = Box<dyn Fn(&str) -> ConnectorResult<Vec<Row>> + Send + Sync>;

/// In-memory relational source with an `orders(region, total)` table.
pub struct FakeConnector {
    respond: Responder,
    delay: Duration,
    executions: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(respond: Responder) -> Self {
        Self {
            respond,
            delay: Duration::ZERO,
            executions: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Always returns the same rows.
    pub fn returning(rows: Vec<Row>) -> Self {
        Self::new(Box::new(move |_: &str| Ok(rows.clone())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn dialect(&self) -> Dialect {
        Dialect::RelationalSql
    }

    async fn test(&self) -> ConnectionTest {
        ConnectionTest {
            ok: true,
            message: "fake source reachable".into(),
            table_names: vec!["orders".into()],
        }
    }

    async fn introspect(&self) -> ConnectorResult<RawSchema> {
        Ok(RawSchema {
            tables: vec![RawTable {
                name: "orders".into(),
                columns: vec![
                    RawColumn {
                        name: "id".into(),
                        data_type: "integer".into(),
                        nullable: false,
                    },
                    RawColumn {
                        name: "region".into(),
                        data_type: "text".into(),
                        nullable: true,
                    },
                    RawColumn {
                        name: "total".into(),
                        data_type: "numeric".into(),
                        nullable: true,
                    },
                ],
                primary_key: vec!["id".into()],
                foreign_keys: vec![],
            }],
        })
    }

    async fn execute(&self, query: &str, limit: usize, _timeout: Duration) -> ConnectorResult<QueryOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut rows = (self.respond)(query)?;
        rows.truncate(limit);
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Ok(QueryOutput {
            columns,
            rows,
            duration: self.delay,
        })
    }

    async fn close(&self) {}
}

/// Provider that replays canned model replies in order.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Each completion takes `delay` before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn is_configured(&self) -> bool {
        true
    }

    async fn complete(&self, _system: &str, prompt: &str) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::GenerationFailed("script exhausted".into()))?;
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 10,
            },
            latency: Duration::from_millis(1),
        })
    }
}

#[derive(Default)]
pub struct CollectingSink(pub Mutex<Vec<AuditEvent>>);

impl AuditSink for CollectingSink {
    fn record(&self, event: &AuditEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl CollectingSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.0.lock().unwrap().clone()
    }
}

pub fn answer(query: &str, confidence: f64) -> String {
    json!({
        "sql_query": query,
        "explanation": "test answer",
        "confidence": confidence,
    })
    .to_string()
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn region_totals() -> Vec<Row> {
    vec![
        row(&[("region", json!("EU")), ("total", json!(120))]),
        row(&[("region", json!("US")), ("total", json!(340))]),
    ]
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        query_timeout: Duration::from_secs(5),
        checkout_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

pub fn handle(connector: Arc<FakeConnector>) -> DataSourceHandle {
    DataSourceHandle::from_connector("fake", connector, 4, Duration::from_secs(5))
}

pub fn unknown_column(name: &str) -> ConnectorError {
    ConnectorError::execution(format!("column \"{}\" does not exist", name))
}
