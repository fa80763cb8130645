//! Audit events
//!
//! One structured event per `ask` call. The engine hands events to an
//! `AuditSink` and keeps nothing itself.

use crate::llm::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub request_id: Uuid,
    pub data_source_id: String,
    pub question: String,
    pub query_text: Option<String>,
    pub attempts: u32,
    pub healed: bool,
    pub cache_hit: bool,
    /// `ok`, `requires_confirmation`, or an error tag.
    pub outcome: String,
    pub row_count: Option<usize>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub llm_latency_ms: u64,
    pub total_latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits events as JSON on the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "audit", "{}", json),
            Err(e) => info!(target: "audit", request_id = %event.request_id, "unserializable audit event: {}", e),
        }
    }
}

/// Counters shared across the stages of one request.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    generations: AtomicU32,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    llm_latency_ms: AtomicU64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generation(&self, usage: TokenUsage, latency: Duration) {
        self.generations.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        self.llm_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn generations(&self) -> u32 {
        self.generations.load(Ordering::Relaxed)
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::Relaxed)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Relaxed)
    }

    pub fn llm_latency_ms(&self) -> u64 {
        self.llm_latency_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AuditEvent>>);

    impl AuditSink for Collect {
        fn record(&self, event: &AuditEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_metrics_accumulate_across_generations() {
        let metrics = RequestMetrics::new();
        metrics.record_generation(
            TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            },
            Duration::from_millis(300),
        );
        metrics.record_generation(
            TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 25,
            },
            Duration::from_millis(200),
        );
        assert_eq!(metrics.generations(), 2);
        assert_eq!(metrics.prompt_tokens(), 220);
        assert_eq!(metrics.completion_tokens(), 45);
        assert_eq!(metrics.llm_latency_ms(), 500);
    }

    #[test]
    fn test_event_serializes_and_reaches_sink() {
        let sink = Collect::default();
        let event = AuditEvent {
            request_id: Uuid::new_v4(),
            data_source_id: "warehouse".into(),
            question: "revenue by region".into(),
            query_text: Some("SELECT 1".into()),
            attempts: 2,
            healed: true,
            cache_hit: false,
            outcome: "ok".into(),
            row_count: Some(4),
            prompt_tokens: 10,
            completion_tokens: 5,
            llm_latency_ms: 12,
            total_latency_ms: 40,
            timestamp: Utc::now(),
        };
        sink.record(&event);
        TracingAuditSink.record(&event);
        let json = serde_json::to_value(&sink.0.lock().unwrap()[0]).unwrap();
        assert_eq!(json["healed"], serde_json::json!(true));
        assert_eq!(json["outcome"], serde_json::json!("ok"));
    }
}
