//! Anthropic messages-API provider.

use super::{dummy_completion, error_body, http_client, Completion, LlmProvider, TokenUsage, DUMMY_API_KEY};
use crate::config::LlmSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
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
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        if self.api_key == DUMMY_API_KEY {
            return Ok(dummy_completion());
        }
        if self.api_key.is_empty() {
            return Err(EngineError::GenerationFailed("Anthropic API key is not configured".to_string()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("LLM API call failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::GenerationFailed(error_body(response).await));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("Failed to parse LLM response: {}", e)))?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            })
            .unwrap_or_default();
        let latency = started.elapsed();
        debug!("Anthropic completion: {} tokens in {:?}", usage.total(), latency);
        Ok(Completion { text, usage, latency })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_response_parses() {
        let body = r#"{"content":[{"type":"text","text":"{\"sql_query\":\"SELECT 1\"}"}],"usage":{"input_tokens":12,"output_tokens":7}}"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.content[0].text, r#"{"sql_query":"SELECT 1"}"#);
        assert_eq!(parsed.usage.unwrap().output_tokens, 7);
    }
}
