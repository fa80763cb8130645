//! Query Engine
//!
//! Entry point tying the stages together for one question:
//! schema snapshot, optional semantic narrowing, cache lookup, generation,
//! confidence gate, healing loop (validate + execute), chart recommendation.

use crate::cache::{CachedAnswer, Fingerprint, ResultCache};
use crate::config::{EngineConfig, ProviderKind};
use crate::connectors::{ConnectionTest, DataSourceHandle, Row};
use crate::conversation::{ConversationStore, InMemoryConversationStore, ThreadLocks};
use crate::error::{EngineError, Result};
use crate::execution::Executor;
use crate::execution_loop::{HealingLoop, HealingStages};
use crate::generator::{ConversationTurn, GeneratedQuery, QueryContext, QueryGenerator};
use crate::llm::LlmProvider;
use crate::maintenance::MaintenanceTask;
use crate::observability::{AuditEvent, AuditSink, RequestMetrics, TracingAuditSink};
use crate::safety::SafetyValidator;
use crate::schema::{SchemaService, SchemaSnapshot};
use crate::schema_rag::{Embedder, OpenAiEmbedder, SemanticFilter};
use crate::visualization::{ChartRecommendation, VisualizationClassifier};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Execute even if the generation's confidence is below the threshold.
    pub confirmed: bool,
    /// Overrides the data source's default execution bound.
    pub timeout: Option<Duration>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub request_id: Uuid,
    pub query_text: String,
    pub explanation: String,
    pub confidence: f64,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartRecommendation>,
    pub execution_time_ms: u64,
    pub truncated: bool,
    pub requires_confirmation: bool,
    pub attempts: u32,
    pub healed: bool,
    pub cache_hit: bool,
    #[serde(skip)]
    pub answer_summary: String,
}

impl AskResponse {
    fn from_answer(request_id: Uuid, answer: &CachedAnswer, cache_hit: bool) -> Self {
        Self {
            request_id,
            query_text: answer.query_text.clone(),
            explanation: answer.explanation.clone(),
            confidence: answer.confidence,
            columns: answer.result.columns.clone(),
            rows: answer.result.rows.clone(),
            row_count: answer.result.row_count(),
            chart: Some(answer.chart.clone()),
            execution_time_ms: answer.result.duration.as_millis() as u64,
            truncated: answer.result.truncated,
            requires_confirmation: false,
            attempts: answer.attempts,
            healed: answer.healed,
            cache_hit,
            answer_summary: answer.result.summary(),
        }
    }

    /// Low-confidence generation handed back unexecuted.
    fn needs_confirmation(query: &GeneratedQuery) -> Self {
        Self {
            request_id: query.request_id(),
            query_text: query.text().to_string(),
            explanation: query.explanation().to_string(),
            confidence: query.confidence(),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            chart: None,
            execution_time_ms: 0,
            truncated: false,
            requires_confirmation: true,
            attempts: query.attempt(),
            healed: false,
            cache_hit: false,
            answer_summary: String::new(),
        }
    }
}

/// Ways the cached computation can end without producing an answer.
enum Interrupted {
    NeedsConfirmation(GeneratedQuery),
    Failed(EngineError),
}

pub struct QueryEngine {
    config: EngineConfig,
    schema: Arc<SchemaService>,
    semantic_filter: Option<SemanticFilter>,
    generator: QueryGenerator,
    validator: SafetyValidator,
    executor: Executor,
    healing: HealingLoop,
    visualizer: VisualizationClassifier,
    cache: Arc<ResultCache>,
    conversations: Arc<dyn ConversationStore>,
    thread_locks: Arc<ThreadLocks>,
    audit: Arc<dyn AuditSink>,
}

impl QueryEngine {
    /// Build an engine around one injected language-model provider.
    pub fn new(config: EngineConfig, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        config.validate()?;

        let semantic_filter = match config.llm.provider {
            ProviderKind::OpenAi => {
                let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
                    config.llm.api_key.clone(),
                    config.llm.embedding_base_url.clone(),
                    config.llm.embedding_model.clone(),
                ));
                Some(SemanticFilter::new(
                    embedder,
                    config.semantic_filter_threshold,
                    config.semantic_top_k,
                ))
            }
            _ => None,
        };

        info!(
            "Query engine ready (provider: {}, max rows: {}, healing attempts: {})",
            provider.name(),
            config.max_rows,
            config.max_healing_attempts
        );

        Ok(Self {
            schema: Arc::new(SchemaService::new(config.schema_ttl)),
            semantic_filter,
            generator: QueryGenerator::new(
                provider,
                config.confidence_threshold,
                config.history_char_budget,
                config.max_rows,
            ),
            validator: SafetyValidator::new(config.max_rows),
            executor: Executor::new(config.checkout_timeout),
            healing: HealingLoop::new(config.max_healing_attempts),
            visualizer: VisualizationClassifier::new(
                config.chart_sample_rows,
                config.max_chart_columns,
                config.donut_epsilon,
            ),
            cache: Arc::new(ResultCache::new(config.cache_ttl, config.cache_capacity)),
            conversations: Arc::new(InMemoryConversationStore::new(config.history_max_turns)),
            thread_locks: Arc::new(ThreadLocks::new()),
            audit: Arc::new(TracingAuditSink),
            config,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.semantic_filter = Some(SemanticFilter::new(
            embedder,
            self.config.semantic_filter_threshold,
            self.config.semantic_top_k,
        ));
        self
    }

    pub fn without_semantic_filter(mut self) -> Self {
        self.semantic_filter = None;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema_service(&self) -> &Arc<SchemaService> {
        &self.schema
    }

    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Answer one question against `handle`.
    pub async fn ask(&self, handle: &DataSourceHandle, request: AskRequest) -> Result<AskResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let metrics = RequestMetrics::new();
        info!("Request {} on {}: {}", request_id, handle.id(), request.question);

        let outcome = self.answer(handle, &request, request_id, &metrics).await;

        let (outcome_tag, query_text, attempts, healed, cache_hit, row_count) = match &outcome {
            Ok(r) if r.requires_confirmation => (
                "requires_confirmation",
                Some(r.query_text.clone()),
                r.attempts,
                false,
                false,
                None,
            ),
            Ok(r) => ("ok", Some(r.query_text.clone()), r.attempts, r.healed, r.cache_hit, Some(r.row_count)),
            Err(e) => {
                let attempts = match e {
                    EngineError::ExecutionFailed { attempts, .. } => *attempts,
                    _ => metrics.generations(),
                };
                warn!("Request {} failed [{}]: {}", request_id, e.tag(), e);
                (e.tag(), None, attempts, false, false, None)
            }
        };
        self.audit.record(&AuditEvent {
            request_id,
            data_source_id: handle.id().to_string(),
            question: request.question.clone(),
            query_text,
            attempts,
            healed,
            cache_hit,
            outcome: outcome_tag.to_string(),
            row_count,
            prompt_tokens: metrics.prompt_tokens(),
            completion_tokens: metrics.completion_tokens(),
            llm_latency_ms: metrics.llm_latency_ms(),
            total_latency_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        outcome.map(|mut response| {
            response.request_id = request_id;
            response
        })
    }

    async fn answer(
        &self,
        handle: &DataSourceHandle,
        request: &AskRequest,
        request_id: Uuid,
        metrics: &RequestMetrics,
    ) -> Result<AskResponse> {
        if request.question.trim().is_empty() {
            return Err(EngineError::GenerationFailed("Question is empty".to_string()));
        }

        let snapshot = self.schema.get_snapshot(handle, false).await?;
        let ctx = self.build_context(handle, request, Arc::clone(&snapshot)).await;
        let prior: Vec<String> = ctx.history().iter().map(|t| t.question.clone()).collect();
        let fingerprint = Fingerprint::compute(handle.id(), &request.question, &prior, snapshot.version());

        let stages = HealingStages {
            generator: &self.generator,
            validator: &self.validator,
            executor: &self.executor,
            handle,
            metrics,
        };
        let (stages, ctx) = (&stages, &ctx);
        // `seed` skips generation and continues from an already generated query.
        let compute = move |seed: Option<GeneratedQuery>| async move {
            let first = match seed {
                Some(query) => query,
                None => {
                    let query = self
                        .generator
                        .generate(ctx, request_id, 1, None)
                        .await
                        .map_err(Interrupted::Failed)?;
                    metrics.record_generation(query.usage(), query.llm_latency());
                    query
                }
            };

            if !request.confirmed && self.generator.requires_confirmation(&first) {
                info!(
                    "Request {} needs confirmation (confidence {:.2})",
                    request_id,
                    first.confidence()
                );
                return Err(Interrupted::NeedsConfirmation(first));
            }

            let outcome = self
                .healing
                .run(stages, ctx, first, request.timeout)
                .await
                .map_err(Interrupted::Failed)?;
            let chart = self.visualizer.recommend(&outcome.result);
            Ok::<_, Interrupted>(CachedAnswer {
                query_text: outcome.validated.text,
                explanation: outcome.query.explanation().to_string(),
                confidence: outcome.query.confidence(),
                result: outcome.result,
                chart,
                attempts: outcome.attempts,
                healed: outcome.healed,
                created_at: Utc::now(),
            })
        };

        let interrupted = match self.cache.get_or_compute(handle.id(), &fingerprint, compute(None)).await {
            Ok((answer, hit)) => return Ok(AskResponse::from_answer(request_id, &answer, hit)),
            Err(interrupted) => interrupted,
        };
        match &*interrupted {
            // Joined an unconfirmed caller's run; this caller already confirmed.
            Interrupted::NeedsConfirmation(query) if request.confirmed => {
                info!(
                    "Request {} confirmed; executing query held for confirmation",
                    request_id
                );
                match compute(Some(query.clone())).await {
                    Ok(answer) => {
                        let answer = self.cache.insert(handle.id(), &fingerprint, answer).await;
                        Ok(AskResponse::from_answer(request_id, &answer, false))
                    }
                    Err(Interrupted::NeedsConfirmation(query)) => Ok(AskResponse::needs_confirmation(&query)),
                    Err(Interrupted::Failed(e)) => Err(e),
                }
            }
            Interrupted::NeedsConfirmation(query) => Ok(AskResponse::needs_confirmation(query)),
            Interrupted::Failed(e) => Err(e.clone()),
        }
    }

    async fn build_context(
        &self,
        handle: &DataSourceHandle,
        request: &AskRequest,
        snapshot: Arc<SchemaSnapshot>,
    ) -> QueryContext {
        let focus = match &self.semantic_filter {
            Some(filter) => filter.select_tables(&snapshot, &request.question).await,
            None => None,
        };
        QueryContext::new(
            request.question.clone(),
            request.history.clone(),
            snapshot,
            handle.dialect(),
            self.config.history_max_turns,
        )
        .with_focus_tables(focus)
    }

    /// Ask within a conversation thread. Turns of one thread are applied in
    /// arrival order; answered turns are appended to the thread's history.
    pub async fn ask_in_thread(
        &self,
        handle: &DataSourceHandle,
        thread_id: &str,
        question: &str,
        confirmed: bool,
    ) -> Result<AskResponse> {
        let _turn = self.thread_locks.acquire(thread_id).await;
        let mut request = AskRequest::new(question).with_history(self.conversations.history(thread_id).await);
        request.confirmed = confirmed;

        let response = self.ask(handle, request).await?;
        if !response.requires_confirmation {
            self.conversations
                .append(
                    thread_id,
                    ConversationTurn::new(question, response.query_text.clone(), response.answer_summary.clone()),
                )
                .await;
        }
        Ok(response)
    }

    pub async fn history(&self, thread_id: &str) -> Vec<ConversationTurn> {
        self.conversations.history(thread_id).await
    }

    /// Health check; never fails.
    pub async fn test_connection(&self, handle: &DataSourceHandle) -> ConnectionTest {
        let test = handle.connector().test().await;
        if test.ok {
            info!("Connection test for {} passed: {}", handle.id(), test.message);
        } else {
            warn!("Connection test for {} failed: {}", handle.id(), test.message);
        }
        test
    }

    /// Re-introspect now. Cached answers keyed to the old version stop matching.
    pub async fn refresh_schema(&self, handle: &DataSourceHandle) -> Result<Arc<SchemaSnapshot>> {
        self.schema.get_snapshot(handle, true).await
    }

    /// Forget the schema snapshot and every cached answer for a data source.
    pub async fn invalidate_schema(&self, data_source_id: &str) {
        self.schema.invalidate(data_source_id).await;
        self.cache.invalidate(data_source_id).await;
    }

    pub async fn invalidate_cache(&self, data_source_id: &str) {
        self.cache.invalidate(data_source_id).await;
    }

    /// Suggested rephrasings; executes nothing.
    pub async fn refine(
        &self,
        handle: &DataSourceHandle,
        question: &str,
        history: Vec<ConversationTurn>,
    ) -> Result<Vec<String>> {
        let snapshot = self.schema.get_snapshot(handle, false).await?;
        let request = AskRequest::new(question).with_history(history);
        let ctx = self.build_context(handle, &request, snapshot).await;
        Ok(self.generator.refine(&ctx).await)
    }

    /// Close the data source and drop everything cached for it.
    pub async fn disconnect(&self, handle: &DataSourceHandle) {
        handle.close().await;
        self.invalidate_schema(handle.id()).await;
        self.thread_locks.prune();
    }

    pub fn spawn_maintenance(&self, token: CancellationToken) -> MaintenanceTask {
        MaintenanceTask::spawn(
            Arc::clone(&self.schema),
            Arc::clone(&self.cache),
            Arc::clone(&self.thread_locks),
            self.config.maintenance_interval,
            token,
        )
    }
}
