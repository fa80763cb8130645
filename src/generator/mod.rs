//! Query Generator
//!
//! Turns a question plus schema context into a candidate query through the
//! injected language-model provider.

pub mod context;
pub mod prompt;

pub use context::{ConversationTurn, QueryContext};
pub use prompt::HealingHint;

use crate::connectors::Dialect;
use crate::error::{EngineError, Result};
use crate::llm::{clean_json_response, LlmProvider, ModelAnswer, TokenUsage};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_SUGGESTIONS: usize = 5;
const FUZZY_MATCH_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    Select,
    With,
    Find,
    Aggregate,
    Other(String),
}

impl StatementType {
    pub fn classify(dialect: Dialect, text: &str) -> Self {
        if dialect == Dialect::Document {
            return match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) if value.get("pipeline").is_some() => StatementType::Aggregate,
                Ok(value) if value.get("collection").is_some() => StatementType::Find,
                _ => StatementType::Other("unparsed".to_string()),
            };
        }
        let first = text
            .trim_start()
            .trim_start_matches('(')
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        match first.as_str() {
            "select" => StatementType::Select,
            "with" => StatementType::With,
            other => StatementType::Other(other.to_string()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self, StatementType::Other(_))
    }
}

/// One candidate query. Never mutated; a retry produces a new value with
/// the same `request_id` and the next `attempt`.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuery {
    request_id: Uuid,
    attempt: u32,
    text: String,
    dialect: Dialect,
    explanation: String,
    confidence: f64,
    statement_type: StatementType,
    usage: TokenUsage,
    #[serde(skip)]
    llm_latency: Duration,
}

impl GeneratedQuery {
    pub fn new(
        request_id: Uuid,
        attempt: u32,
        dialect: Dialect,
        text: impl Into<String>,
        explanation: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let text = text.into();
        Self {
            request_id,
            attempt,
            statement_type: StatementType::classify(dialect, &text),
            text,
            dialect,
            explanation: explanation.into(),
            confidence: confidence.clamp(0.0, 1.0),
            usage: TokenUsage::default(),
            llm_latency: Duration::ZERO,
        }
    }

    fn from_answer(request_id: Uuid, attempt: u32, dialect: Dialect, answer: ModelAnswer) -> Self {
        let mut query = Self::new(
            request_id,
            attempt,
            dialect,
            answer.sql_query,
            answer.explanation,
            answer.confidence,
        );
        query.usage = answer.usage;
        query.llm_latency = answer.latency;
        query
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn statement_type(&self) -> &StatementType {
        &self.statement_type
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn llm_latency(&self) -> Duration {
        self.llm_latency
    }
}

#[derive(Deserialize)]
struct RefineAnswer {
    #[serde(default)]
    suggestions: Vec<String>,
}

pub struct QueryGenerator {
    provider: Arc<dyn LlmProvider>,
    confidence_threshold: f64,
    history_char_budget: usize,
    max_rows: usize,
}

impl QueryGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        confidence_threshold: f64,
        history_char_budget: usize,
        max_rows: usize,
    ) -> Self {
        Self {
            provider,
            confidence_threshold,
            history_char_budget,
            max_rows,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Generate a candidate query. A failed call is retried once with a
    /// stricter prompt before surfacing `GenerationFailed`.
    pub async fn generate(
        &self,
        ctx: &QueryContext,
        request_id: Uuid,
        attempt: u32,
        hint: Option<&HealingHint>,
    ) -> Result<GeneratedQuery> {
        let prompt = prompt::build_generation_prompt(ctx, self.max_rows, self.history_char_budget, hint, false);
        let answer = match self.provider.generate_query(&prompt).await {
            Ok(answer) => answer,
            Err(first) => {
                warn!(
                    "Generation via {} failed ({}); retrying with stricter prompt",
                    self.provider.name(),
                    first
                );
                let strict =
                    prompt::build_generation_prompt(ctx, self.max_rows, self.history_char_budget, hint, true);
                self.provider.generate_query(&strict).await.map_err(|e| match e {
                    EngineError::GenerationFailed(msg) => {
                        EngineError::GenerationFailed(format!("{} (after stricter retry)", msg))
                    }
                    other => EngineError::GenerationFailed(other.to_string()),
                })?
            }
        };

        let query = GeneratedQuery::from_answer(request_id, attempt, ctx.dialect(), answer);
        info!(
            "Generated query attempt {} for request {} (confidence {:.2})",
            attempt, request_id, query.confidence()
        );
        debug!("Generated query text: {}", query.text());
        Ok(query)
    }

    /// Low-confidence generations are returned to the caller for confirmation.
    pub fn requires_confirmation(&self, query: &GeneratedQuery) -> bool {
        query.confidence() < self.confidence_threshold
    }

    /// Alternative phrasings for "did you mean" prompts. Never executes anything.
    pub async fn refine(&self, ctx: &QueryContext) -> Vec<String> {
        let mut suggestions = fuzzy_suggestions(ctx.question(), &ctx.schema().identifiers());

        let prompt = prompt::build_refine_prompt(ctx);
        match self.provider.complete(&prompt.system, &prompt.user).await {
            Ok(completion) => {
                match serde_json::from_str::<RefineAnswer>(clean_json_response(&completion.text)) {
                    Ok(answer) => suggestions.extend(answer.suggestions),
                    Err(e) => warn!("Ignoring unparseable refine suggestions: {}", e),
                }
            }
            Err(e) => warn!("Refine call failed, using fuzzy suggestions only: {}", e),
        }

        let original = ctx.question().trim().to_lowercase();
        suggestions
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s.to_lowercase() != original)
            .unique_by(|s| s.to_lowercase())
            .take(MAX_SUGGESTIONS)
            .collect()
    }
}

/// Rephrase the question with near-miss words replaced by schema identifiers.
pub fn fuzzy_suggestions(question: &str, identifiers: &[String]) -> Vec<String> {
    let vocabulary: Vec<String> = identifiers
        .iter()
        .flat_map(|id| {
            let lowered = id.to_lowercase();
            let mut words: Vec<String> = lowered.split('_').map(String::from).collect();
            words.push(lowered);
            words
        })
        .filter(|w| w.len() >= 3)
        .unique()
        .collect();

    let mut corrected = Vec::new();
    let mut changed = false;
    for word in question.split_whitespace() {
        let bare = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
        let lowered = bare.to_lowercase();
        if lowered.len() < 4 || vocabulary.contains(&lowered) {
            corrected.push(word.to_string());
            continue;
        }
        let best = vocabulary
            .iter()
            .map(|candidate| (candidate, strsim::jaro_winkler(&lowered, candidate)))
            .filter(|(_, score)| *score >= FUZZY_MATCH_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        match best {
            Some((candidate, _)) => {
                corrected.push(word.replace(bare, candidate));
                changed = true;
            }
            None => corrected.push(word.to_string()),
        }
    }

    if changed {
        vec![corrected.join(" ")]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_type_classification() {
        assert_eq!(StatementType::classify(Dialect::RelationalSql, "  select 1"), StatementType::Select);
        assert_eq!(
            StatementType::classify(Dialect::Warehouse, "WITH t AS (SELECT 1) SELECT * FROM t"),
            StatementType::With
        );
        assert_eq!(
            StatementType::classify(Dialect::RelationalSql, "DELETE FROM t"),
            StatementType::Other("delete".into())
        );
        assert_eq!(
            StatementType::classify(Dialect::Document, r#"{"collection":"o","pipeline":[]}"#),
            StatementType::Aggregate
        );
        assert!(!StatementType::classify(Dialect::Document, "nope").is_read_only());
    }

    #[test]
    fn test_generated_query_clamps_confidence() {
        let q = GeneratedQuery::new(Uuid::new_v4(), 1, Dialect::LocalFile, "SELECT 1", "", 1.4);
        assert_eq!(q.confidence(), 1.0);
        assert!(q.statement_type().is_read_only());
    }

    #[test]
    fn test_fuzzy_suggestions_fix_typos() {
        let ids = vec!["orders".to_string(), "region".to_string(), "total_revenue".to_string()];
        let out = fuzzy_suggestions("show revenu by regoin", &ids);
        assert_eq!(out, vec!["show revenue by region".to_string()]);
        assert!(fuzzy_suggestions("show revenue by region", &ids).is_empty());
    }
}
