//! Query intelligence engine: natural-language questions in, validated and
//! executed queries with a chart recommendation out.

pub mod cache;
pub mod config;
pub mod connectors;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod generator;
pub mod llm;
pub mod maintenance;
pub mod observability;
pub mod safety;
pub mod schema;
pub mod schema_rag;
pub mod visualization;

pub use config::{EngineConfig, LlmSettings, ProviderKind};
pub use connectors::{ConnectionConfig, Connector, DataSourceHandle, Dialect};
pub use engine::{AskRequest, AskResponse, QueryEngine};
pub use error::{EngineError, FailureKind, Result};
