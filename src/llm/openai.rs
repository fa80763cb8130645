//! OpenAI chat-completions provider.

use super::{dummy_completion, error_body, http_client, Completion, LlmProvider, TokenUsage, DUMMY_API_KEY};
use crate::config::LlmSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(120))?,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        if self.api_key == DUMMY_API_KEY {
            return Ok(dummy_completion());
        }
        if self.api_key.is_empty() {
            return Err(EngineError::GenerationFailed("OpenAI API key is not configured".to_string()));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        });
        // Newer models only accept max_completion_tokens.
        if self.model.starts_with("gpt-4o") || self.model.starts_with("o1") || self.model.starts_with("gpt-5") {
            body["max_completion_tokens"] = serde_json::json!(self.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(self.max_tokens);
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("LLM API call failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::GenerationFailed(error_body(response).await));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("Failed to parse LLM response: {}", e)))?;

        let choice = response_json["choices"]
            .get(0)
            .ok_or_else(|| EngineError::GenerationFailed("No choices in LLM response".to_string()))?;
        match choice["finish_reason"].as_str() {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(EngineError::GenerationFailed(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }
        let text = choice["message"]["content"].as_str().unwrap_or_default().to_string();
        let usage = TokenUsage {
            prompt_tokens: response_json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: response_json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
        let latency = started.elapsed();
        debug!("OpenAI completion: {} tokens in {:?}", usage.total(), latency);
        Ok(Completion { text, usage, latency })
    }
}
