//! Ollama provider for locally hosted models.

use super::{error_body, http_client, Completion, LlmProvider, TokenUsage};
use crate::config::LlmSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaProvider {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        Ok(Self {
            // Local models on CPU can take minutes for a first token.
            client: http_client(Duration::from_secs(300))?,
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            temperature: settings.temperature,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn is_configured(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Ollama not reachable at {}: {}", self.base_url, e);
                false
            }
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "format": "json",
            "stream": false,
            "options": {"temperature": self.temperature},
        });

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("Ollama call failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::GenerationFailed(error_body(response).await));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EngineError::GenerationFailed(format!("Failed to parse Ollama response: {}", e)))?;
        let usage = TokenUsage {
            prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
            completion_tokens: parsed.eval_count.unwrap_or(0),
        };
        let latency = started.elapsed();
        debug!("Ollama completion: {} tokens in {:?}", usage.total(), latency);
        Ok(Completion {
            text: parsed.response,
            usage,
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    #[tokio::test]
    async fn test_unreachable_server_is_not_configured() {
        let mut settings = LlmSettings::for_provider(ProviderKind::Ollama);
        settings.base_url = "http://127.0.0.1:9/".to_string();
        let provider = OllamaProvider::new(&settings).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert!(!provider.is_configured().await);
        assert_eq!(provider.complete("s", "u").await.unwrap_err().tag(), "generation_failed");
    }
}
