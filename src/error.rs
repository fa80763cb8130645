use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reason a backend rejected a query.
///
/// Connectors fill this from native error codes when they have them; the
/// error classifier fills it from the message otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownColumn,
    UnknownTable,
    AmbiguousColumn,
    JoinFailure,
    Syntax,
    InvalidAggregation,
    Permission,
    Other,
}

impl FailureKind {
    /// Whether re-prompting the generator with the failure can plausibly fix it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FailureKind::Permission | FailureKind::Other)
    }
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Validation rejected: {}", .reasons.join("; "))]
    ValidationRejected { reasons: Vec<String> },

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error(
        "Execution failed after {attempts} attempt(s){}: {message}",
        exhausted_marker(.healing_exhausted)
    )]
    ExecutionFailed {
        message: String,
        kind: FailureKind,
        attempts: u32,
        healing_exhausted: bool,
    },

    #[error("Timeout exceeded after {elapsed_ms} ms")]
    TimeoutExceeded { elapsed_ms: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable taxonomy tag surfaced to callers alongside the message.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::ValidationRejected { .. } => "validation_rejected",
            EngineError::GenerationFailed(_) => "generation_failed",
            EngineError::ExecutionFailed { .. } => "execution_failed",
            EngineError::TimeoutExceeded { .. } => "timeout_exceeded",
            EngineError::Connection(_) => "connection_error",
            EngineError::Schema(_) => "schema_error",
            EngineError::Config(_) => "config_error",
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        EngineError::ValidationRejected {
            reasons: vec![reason.into()],
        }
    }

    pub fn healing_exhausted(&self) -> bool {
        matches!(
            self,
            EngineError::ExecutionFailed {
                healing_exhausted: true,
                ..
            }
        )
    }
}

fn exhausted_marker(exhausted: &bool) -> &'static str {
    if *exhausted {
        " (auto-correction exhausted)"
    } else {
        ""
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
