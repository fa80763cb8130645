//! Connector Contract
//!
//! One capability set {test, introspect, execute, close} over every backend
//! family. The concrete connector is chosen once, when a `DataSourceHandle`
//! is built from a `ConnectionConfig`; nothing downstream branches on it.

pub mod document;
pub mod local_file;
pub mod postgres;
pub mod warehouse;

use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub use document::DocumentConnector;
pub use local_file::LocalFileConnector;
pub use postgres::PostgresConnector;
pub use warehouse::{WarehouseAuth, WarehouseConnector};

/// One result row; column order is preserved.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    RelationalSql,
    Document,
    Warehouse,
    LocalFile,
}

impl Dialect {
    /// SQL text dialects; document sources take a structured JSON query.
    pub fn is_sql(&self) -> bool {
        !matches!(self, Dialect::Document)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Dialect::RelationalSql => "PostgreSQL",
            Dialect::Document => "MongoDB",
            Dialect::Warehouse => "Trino",
            Dialect::LocalFile => "Polars SQL",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("{reason}")]
    Execution { reason: String, kind: FailureKind },

    #[error("query exceeded its time bound after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Connection(String),

    #[error("introspection failed: {0}")]
    Introspection(String),
}

impl ConnectorError {
    pub fn execution(reason: impl Into<String>) -> Self {
        ConnectorError::Execution {
            reason: reason.into(),
            kind: FailureKind::Other,
        }
    }
}

impl From<ConnectorError> for EngineError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Execution { reason, kind } => EngineError::ExecutionFailed {
                message: reason,
                kind,
                attempts: 1,
                healing_exhausted: false,
            },
            ConnectorError::Timeout(elapsed) => EngineError::TimeoutExceeded {
                elapsed_ms: elapsed.as_millis() as u64,
            },
            ConnectorError::Connection(msg) => EngineError::Connection(msg),
            ConnectorError::Introspection(msg) => EngineError::Schema(msg),
        }
    }
}

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Health-check outcome; never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub message: String,
    pub table_names: Vec<String>,
}

impl ConnectionTest {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            table_names: Vec::new(),
        }
    }
}

/// Backend-native structural metadata, before semantic inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSchema {
    pub tables: Vec<RawTable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub columns: Vec<RawColumn>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub duration: Duration,
}

/// Collect column names in first-seen order across rows.
pub(crate) fn columns_of(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Check reachability and list tables or collections. Must not mutate.
    async fn test(&self) -> ConnectionTest;

    async fn introspect(&self) -> ConnectorResult<RawSchema>;

    /// Run a read query returning at most `limit` rows within `timeout`.
    async fn execute(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> ConnectorResult<QueryOutput>;

    /// Release pooled resources. Idempotent.
    async fn close(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConnectionConfig {
    Postgres {
        url: String,
    },
    Document {
        endpoint: String,
        api_key: String,
        data_source: String,
        database: String,
        collections: Vec<String>,
    },
    Warehouse {
        coordinator_url: String,
        catalog: String,
        schema: String,
        user: String,
        #[serde(default)]
        auth: WarehouseAuth,
    },
    LocalFile {
        tables: BTreeMap<String, PathBuf>,
    },
}

/// A ready-to-use reference to one data source.
///
/// Cloning shares the connector and its pool gate.
#[derive(Clone)]
pub struct DataSourceHandle {
    id: String,
    connector: Arc<dyn Connector>,
    pool_gate: Arc<Semaphore>,
    default_timeout: Duration,
}

impl DataSourceHandle {
    pub fn connect(
        id: impl Into<String>,
        config: ConnectionConfig,
        engine: &EngineConfig,
    ) -> ConnectorResult<Self> {
        let (connector, default_timeout): (Arc<dyn Connector>, Duration) = match config {
            ConnectionConfig::Postgres { url } => (
                Arc::new(PostgresConnector::connect_lazy(
                    &url,
                    engine.pool_capacity(),
                    engine.checkout_timeout,
                )?),
                engine.query_timeout,
            ),
            ConnectionConfig::Document {
                endpoint,
                api_key,
                data_source,
                database,
                collections,
            } => (
                Arc::new(DocumentConnector::new(
                    endpoint,
                    api_key,
                    data_source,
                    database,
                    collections,
                )?),
                engine.query_timeout,
            ),
            ConnectionConfig::Warehouse {
                coordinator_url,
                catalog,
                schema,
                user,
                auth,
            } => (
                Arc::new(WarehouseConnector::new(
                    coordinator_url,
                    catalog,
                    schema,
                    user,
                    auth,
                    engine.warehouse_timeout,
                )?),
                engine.warehouse_timeout,
            ),
            ConnectionConfig::LocalFile { tables } => (
                Arc::new(LocalFileConnector::new(tables)?),
                engine.query_timeout,
            ),
        };
        Ok(Self::from_connector(
            id,
            connector,
            engine.pool_capacity() as usize,
            default_timeout,
        ))
    }

    pub fn from_connector(
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
        pool_capacity: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            connector,
            pool_gate: Arc::new(Semaphore::new(pool_capacity.max(1))),
            default_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.connector.dialect()
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Check out a pool slot, failing with `Connection` instead of waiting past `wait`.
    pub async fn checkout(&self, wait: Duration) -> ConnectorResult<OwnedSemaphorePermit> {
        match tokio::time::timeout(wait, Arc::clone(&self.pool_gate).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ConnectorError::Connection(format!(
                "connection pool for {} is closed",
                self.id
            ))),
            Err(_) => Err(ConnectorError::Connection(format!(
                "connection pool for {} exhausted: no slot within {} ms",
                self.id,
                wait.as_millis()
            ))),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.pool_gate.available_permits()
    }

    pub async fn close(&self) {
        self.pool_gate.close();
        self.connector.close().await;
    }
}

impl std::fmt::Debug for DataSourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceHandle")
            .field("id", &self.id)
            .field("dialect", &self.dialect())
            .finish()
    }
}
