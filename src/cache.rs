//! Result Cache
//!
//! Answers keyed by request fingerprint, with at most one in-flight
//! computation per key: concurrent callers for the same key wait on the
//! first caller's computation instead of hitting the backend again.
//!
//! Invalidation is per data source. Each source has an epoch that is part of
//! every key, so bumping it makes all older entries unreachable at once, even
//! ones whose computation is still running.

use crate::execution::ExecutionResult;
use crate::visualization::ChartRecommendation;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deterministic hash of data source, normalized question text (plus prior
/// questions in the thread) and schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(data_source_id: &str, question: &str, prior_questions: &[String], schema_version: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data_source_id.as_bytes());
        hasher.update([0u8]);
        for prior in prior_questions {
            hasher.update(normalize_question(prior).as_bytes());
            hasher.update([0x1e]);
        }
        hasher.update([0u8]);
        hasher.update(normalize_question(question).as_bytes());
        hasher.update([0u8]);
        hasher.update(schema_version.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lowercase, trimmed, internal whitespace collapsed.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    data_source_id: String,
    epoch: u64,
    fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedAnswer {
    pub query_text: String,
    pub explanation: String,
    pub confidence: f64,
    pub result: ExecutionResult,
    pub chart: ChartRecommendation,
    pub attempts: u32,
    pub healed: bool,
    pub created_at: DateTime<Utc>,
}

pub struct ResultCache {
    entries: Cache<CacheKey, Arc<CachedAnswer>>,
    epochs: DashMap<String, u64>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self {
            entries,
            epochs: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(&self, data_source_id: &str, fingerprint: &Fingerprint) -> CacheKey {
        let epoch = self.epochs.get(data_source_id).map(|e| *e).unwrap_or(0);
        CacheKey {
            data_source_id: data_source_id.to_string(),
            epoch,
            fingerprint: fingerprint.clone(),
        }
    }

    pub async fn get(&self, data_source_id: &str, fingerprint: &Fingerprint) -> Option<Arc<CachedAnswer>> {
        self.entries.get(&self.key(data_source_id, fingerprint)).await
    }

    /// Return the cached answer or run `compute`, sharing one run among all
    /// concurrent callers of the same key. The flag is `true` when the answer
    /// did not come from this caller's own computation.
    ///
    /// Errors are not cached; every waiter of a failed run receives the same error.
    pub async fn get_or_compute<F, E>(
        &self,
        data_source_id: &str,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> std::result::Result<(Arc<CachedAnswer>, bool), Arc<E>>
    where
        F: Future<Output = std::result::Result<CachedAnswer, E>>,
        E: Send + Sync + 'static,
    {
        let key = self.key(data_source_id, fingerprint);
        let entry = self
            .entries
            .entry(key)
            .or_try_insert_with(async { compute.await.map(Arc::new) })
            .await?;
        let hit = !entry.is_fresh();
        debug!(
            "Result cache {} for {} ({})",
            if hit { "hit" } else { "miss" },
            data_source_id,
            fingerprint.as_str()
        );
        Ok((entry.into_value(), hit))
    }

    /// Store an answer computed outside `get_or_compute`.
    pub async fn insert(
        &self,
        data_source_id: &str,
        fingerprint: &Fingerprint,
        answer: CachedAnswer,
    ) -> Arc<CachedAnswer> {
        let answer = Arc::new(answer);
        self.entries
            .insert(self.key(data_source_id, fingerprint), Arc::clone(&answer))
            .await;
        answer
    }

    /// Drop every entry for `data_source_id`.
    pub async fn invalidate(&self, data_source_id: &str) {
        let epoch = {
            let mut entry = self.epochs.entry(data_source_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let source = data_source_id.to_string();
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |key, _| key.data_source_id == source && key.epoch < epoch)
        {
            warn!("Could not schedule cache purge for {}: {}", data_source_id, e);
        }
        info!("Invalidated result cache for {} (epoch {})", data_source_id, epoch);
    }

    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}
