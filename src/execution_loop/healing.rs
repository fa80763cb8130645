//! Healing Loop
//!
//! Bounded validate/execute/re-generate cycle. Each request moves through
//! `Pending -> Validating -> Executing -> {Succeeded | Failed}`; a failure the
//! classifier deems recoverable sends the request back through generation
//! with the error attached as a correction hint.

use crate::connectors::{ConnectorError, DataSourceHandle};
use crate::error::{EngineError, FailureKind, Result};
use crate::execution::{ExecutionResult, Executor};
use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::generator::{GeneratedQuery, HealingHint, QueryContext, QueryGenerator};
use crate::observability::RequestMetrics;
use crate::safety::{SafetyValidator, ValidatedQuery};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Validating,
    Executing,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "pending",
            RequestState::Validating => "validating",
            RequestState::Executing => "executing",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Stages the loop drives; borrowed from the engine for one request.
pub struct HealingStages<'a> {
    pub generator: &'a QueryGenerator,
    pub validator: &'a SafetyValidator,
    pub executor: &'a Executor,
    pub handle: &'a DataSourceHandle,
    pub metrics: &'a RequestMetrics,
}

#[derive(Debug)]
pub struct HealingOutcome {
    pub query: GeneratedQuery,
    pub validated: ValidatedQuery,
    pub result: ExecutionResult,
    /// Generations used, including the first.
    pub attempts: u32,
    /// True when a later attempt succeeded after an earlier one failed.
    pub healed: bool,
}

pub struct HealingLoop {
    max_attempts: u32,
    error_classifier: ErrorClassifier,
}

impl HealingLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            error_classifier: ErrorClassifier::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive `first` (attempt 1, already generated) to a result.
    ///
    /// Validation rejections, timeouts and connection errors surface at once.
    /// Only recoverable execution failures trigger re-generation, and at most
    /// `max_attempts` generations happen in total.
    pub async fn run(
        &self,
        stages: &HealingStages<'_>,
        ctx: &QueryContext,
        first: GeneratedQuery,
        timeout: Option<Duration>,
    ) -> Result<HealingOutcome> {
        let request_id = first.request_id();
        let mut state = RequestState::Pending;
        let mut query = first;
        let mut last_failure: Option<(String, FailureKind)> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let hint = match &last_failure {
                    Some((message, _)) => HealingHint {
                        failed_query: query.text().to_string(),
                        error: message.clone(),
                    },
                    None => break,
                };
                info!(
                    "Healing attempt {} of {} for request {}",
                    attempt, self.max_attempts, request_id
                );
                query = stages
                    .generator
                    .generate(ctx, request_id, attempt, Some(&hint))
                    .await?;
                stages
                    .metrics
                    .record_generation(query.usage(), query.llm_latency());
            }

            transition(&mut state, RequestState::Validating, attempt);
            let validated = match stages.validator.validate(&query) {
                Ok(v) => v,
                Err(e) => {
                    transition(&mut state, RequestState::Failed, attempt);
                    return Err(e);
                }
            };

            transition(&mut state, RequestState::Executing, attempt);
            match stages.executor.run(stages.handle, &validated, timeout).await {
                Ok(result) => {
                    transition(&mut state, RequestState::Succeeded, attempt);
                    if attempt > 1 {
                        info!("Request {} healed on attempt {}", request_id, attempt);
                    }
                    return Ok(HealingOutcome {
                        query,
                        validated,
                        result,
                        attempts: attempt,
                        healed: attempt > 1,
                    });
                }
                Err(err @ (ConnectorError::Timeout(_) | ConnectorError::Connection(_))) => {
                    transition(&mut state, RequestState::Failed, attempt);
                    return Err(err.into());
                }
                Err(err) => {
                    transition(&mut state, RequestState::Failed, attempt);
                    let kind = self.error_classifier.classify(&err);
                    let message = err.to_string();
                    if !kind.is_recoverable() {
                        warn!("Unrecoverable {:?} failure on attempt {}: {}", kind, attempt, message);
                        return Err(EngineError::ExecutionFailed {
                            message,
                            kind,
                            attempts: attempt,
                            healing_exhausted: false,
                        });
                    }
                    warn!("Recoverable {:?} failure on attempt {}: {}", kind, attempt, message);
                    last_failure = Some((message, kind));
                }
            }
        }

        let (message, kind) = last_failure.unwrap_or_else(|| ("no attempt executed".to_string(), FailureKind::Other));
        Err(EngineError::ExecutionFailed {
            message,
            kind,
            attempts: self.max_attempts,
            healing_exhausted: self.max_attempts > 1,
        })
    }
}

fn transition(state: &mut RequestState, next: RequestState, attempt: u32) {
    debug!("Request state {} -> {} (attempt {})", state, next, attempt);
    *state = next;
}
