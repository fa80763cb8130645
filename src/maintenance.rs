//! Background maintenance
//!
//! Periodic eviction of expired schema snapshots, cached results and idle
//! conversation-thread locks, run as its own task with a cancellation token
//! instead of ambient timers.

use crate::cache::ResultCache;
use crate::conversation::ThreadLocks;
use crate::schema::SchemaService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct MaintenanceTask {
    token: CancellationToken,
    handle: JoinHandle<u64>,
}

impl MaintenanceTask {
    /// Start sweeping every `interval` until `token` is cancelled.
    pub fn spawn(
        schema: Arc<SchemaService>,
        cache: Arc<ResultCache>,
        thread_locks: Arc<ThreadLocks>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            let mut sweeps = 0u64;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        schema.sweep_expired().await;
                        cache.run_pending_tasks().await;
                        thread_locks.prune();
                        sweeps += 1;
                        debug!(
                            "Maintenance sweep {} done ({} cached results, {} thread locks)",
                            sweeps,
                            cache.entry_count(),
                            thread_locks.len()
                        );
                    }
                }
            }
            info!("Maintenance task stopped after {} sweeps", sweeps);
            sweeps
        });
        Self { token, handle }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel and wait for the task; returns the number of sweeps run.
    pub async fn shutdown(self) -> u64 {
        self.token.cancel();
        self.handle.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweeps_until_cancelled() {
        let schema = Arc::new(SchemaService::new(Duration::from_secs(60)));
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), 10));
        let locks = Arc::new(ThreadLocks::new());
        drop(locks.acquire("finished-thread").await);
        let held = locks.acquire("active-thread").await;

        let task = MaintenanceTask::spawn(
            schema,
            cache,
            Arc::clone(&locks),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sweeps = task.shutdown().await;
        assert!(sweeps >= 1);
        assert_eq!(locks.len(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_parent_token_stops_task() {
        let parent = CancellationToken::new();
        let task = MaintenanceTask::spawn(
            Arc::new(SchemaService::new(Duration::from_secs(60))),
            Arc::new(ResultCache::new(Duration::from_secs(60), 10)),
            Arc::new(ThreadLocks::new()),
            Duration::from_secs(3600),
            parent.child_token(),
        );
        parent.cancel();
        assert_eq!(task.shutdown().await, 0);
    }
}
