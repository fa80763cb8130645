//! Query Executor
//!
//! Runs a validated query on a data source under a connection-pool slot and a
//! hard time bound, then enforces the row limit on whatever came back.

use crate::connectors::{ConnectorError, ConnectorResult, DataSourceHandle};
use crate::execution::result::ExecutionResult;
use crate::safety::ValidatedQuery;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Headroom for a connector to cancel its own backend work after its bound
/// expires, before the executor gives up on it.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

pub struct Executor {
    checkout_timeout: Duration,
}

impl Executor {
    pub fn new(checkout_timeout: Duration) -> Self {
        Self { checkout_timeout }
    }

    /// Execute `query`. `timeout` overrides the handle's default bound.
    ///
    /// The pool slot is held for the whole call and released on every path,
    /// including timeout.
    pub async fn run(
        &self,
        handle: &DataSourceHandle,
        query: &ValidatedQuery,
        timeout: Option<Duration>,
    ) -> ConnectorResult<ExecutionResult> {
        let bound = timeout.unwrap_or_else(|| handle.default_timeout());
        let _permit = handle.checkout(self.checkout_timeout).await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            bound + CANCEL_GRACE,
            handle
                .connector()
                .execute(&query.text, query.fetch_limit(), bound),
        )
        .await;

        let output = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Query on {} cancelled after {} ms",
                    handle.id(),
                    started.elapsed().as_millis()
                );
                return Err(ConnectorError::Timeout(started.elapsed()));
            }
        };

        let mut rows = output.rows;
        let truncated = rows.len() > query.applied_limit;
        rows.truncate(query.applied_limit);
        let duration = started.elapsed();
        debug!(
            "Executed on {} in {} ms: {} rows (truncated: {})",
            handle.id(),
            duration.as_millis(),
            rows.len(),
            truncated
        );

        Ok(ExecutionResult {
            columns: output.columns,
            rows,
            duration,
            truncated,
            applied_limit: query.applied_limit,
        })
    }
}
