//! Language-Model Providers
//!
//! One capability contract over hosted and local models. The generator is
//! handed a single `Arc<dyn LlmProvider>` at construction; which backend it
//! is gets decided once from configuration by `provider_from_settings`.

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use crate::config::{LlmSettings, ProviderKind};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DUMMY_API_KEY: &str = "dummy-api-key";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub latency: Duration,
}

/// System and user text for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationPrompt {
    pub system: String,
    pub user: String,
}

/// The model's answer, before the generator stamps request metadata on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAnswer {
    #[serde(alias = "query", alias = "sql", deserialize_with = "query_text")]
    pub sql_query: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(skip)]
    pub usage: TokenUsage,
    #[serde(skip)]
    pub latency: Duration,
}

fn default_confidence() -> f64 {
    0.5
}

/// Document-store queries may come back as a JSON object instead of a string.
fn query_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the provider has what it needs to serve requests.
    async fn is_configured(&self) -> bool;

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion>;

    /// Produce a candidate query for the prompt.
    async fn generate_query(&self, prompt: &GenerationPrompt) -> Result<ModelAnswer> {
        let completion = self.complete(&prompt.system, &prompt.user).await?;
        let mut answer = parse_model_answer(&completion.text)?;
        answer.usage = completion.usage;
        answer.latency = completion.latency;
        Ok(answer)
    }
}

/// Strip markdown fences and surrounding prose from model output.
pub fn clean_json_response(text: &str) -> &str {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    let cleaned = cleaned.trim();
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    }
}

pub fn parse_model_answer(text: &str) -> Result<ModelAnswer> {
    if text.trim().is_empty() {
        return Err(EngineError::GenerationFailed("Model returned an empty response".to_string()));
    }
    let mut answer: ModelAnswer = serde_json::from_str(clean_json_response(text))
        .map_err(|e| EngineError::GenerationFailed(format!("Failed to parse model output: {}", e)))?;
    answer.sql_query = answer.sql_query.trim().to_string();
    if answer.sql_query.is_empty() {
        return Err(EngineError::GenerationFailed("Model returned an empty query".to_string()));
    }
    if !answer.confidence.is_finite() {
        answer.confidence = 0.0;
    }
    answer.confidence = answer.confidence.clamp(0.0, 1.0);
    Ok(answer)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))
}

pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    format!("LLM API error ({}): {}", status, text)
}

/// Canned answer for offline runs with the dummy API key.
pub(crate) fn dummy_completion() -> Completion {
    Completion {
        text: r#"{"sql_query": "SELECT 1 AS value", "explanation": "Offline mode: no model was called.", "confidence": 0.5}"#
            .to_string(),
        usage: TokenUsage::default(),
        latency: Duration::ZERO,
    }
}

pub fn provider_from_settings(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match settings.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(settings)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(settings)?),
    };
    Ok(provider)
}
