//! Engine Configuration
//!
//! Settings are read from the environment (optionally seeded from a `.env`
//! file). Every setting has a default so an empty environment is valid.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Which language-model backend generates queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(EngineError::Config(format!("Unknown LLM provider: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub embedding_model: String,
    pub embedding_base_url: String,
}

impl LlmSettings {
    pub fn for_provider(provider: ProviderKind) -> Self {
        let (model, base_url) = match provider {
            ProviderKind::OpenAi => ("gpt-4o", "https://api.openai.com/v1"),
            ProviderKind::Anthropic => ("claude-3-5-sonnet-20240620", "https://api.anthropic.com/v1"),
            ProviderKind::Ollama => ("llama3", "http://localhost:11434"),
        };
        Self {
            provider,
            api_key: String::new(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            temperature: 0.1,
            max_tokens: 1000,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self::for_provider(ProviderKind::OpenAi)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Generations below this confidence ask the caller to confirm first
    pub confidence_threshold: f64,
    pub query_timeout: Duration,
    /// Default bound for warehouse sources, which run larger scans
    pub warehouse_timeout: Duration,
    pub max_rows: usize,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub checkout_timeout: Duration,
    /// Total generations per request, first attempt included
    pub max_healing_attempts: u32,
    pub schema_ttl: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// Table count above which the semantic filter narrows the prompt
    pub semantic_filter_threshold: usize,
    pub semantic_top_k: usize,
    pub history_max_turns: usize,
    pub history_char_budget: usize,
    pub donut_epsilon: f64,
    pub chart_sample_rows: usize,
    pub max_chart_columns: usize,
    pub maintenance_interval: Duration,
    pub llm: LlmSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            query_timeout: Duration::from_secs(30),
            warehouse_timeout: Duration::from_secs(120),
            max_rows: 1000,
            pool_size: 5,
            max_overflow: 10,
            checkout_timeout: Duration::from_secs(10),
            max_healing_attempts: 2,
            schema_ttl: Duration::from_secs(3600),
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
            semantic_filter_threshold: 20,
            semantic_top_k: 5,
            history_max_turns: 5,
            history_char_budget: 4000,
            donut_epsilon: 2.0,
            chart_sample_rows: 10,
            max_chart_columns: 10,
            maintenance_interval: Duration::from_secs(300),
            llm: LlmSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `QUERYLITE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let provider: ProviderKind = std::env::var("QUERYLITE_LLM_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .parse()?;
        let mut llm = LlmSettings::for_provider(provider);
        llm.api_key = match provider {
            ProviderKind::OpenAi => std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            ProviderKind::Anthropic => std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            ProviderKind::Ollama => String::new(),
        };
        if let Ok(model) = std::env::var("QUERYLITE_LLM_MODEL") {
            llm.model = model;
        }
        if let Ok(base_url) = std::env::var("QUERYLITE_LLM_BASE_URL") {
            llm.base_url = base_url;
        }
        llm.temperature = env_or("QUERYLITE_LLM_TEMPERATURE", llm.temperature)?;
        llm.max_tokens = env_or("QUERYLITE_LLM_MAX_TOKENS", llm.max_tokens)?;
        if let Ok(model) = std::env::var("QUERYLITE_EMBEDDING_MODEL") {
            llm.embedding_model = model;
        }

        let config = Self {
            confidence_threshold: env_or("QUERYLITE_CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?,
            query_timeout: env_secs("QUERYLITE_QUERY_TIMEOUT_SECONDS", defaults.query_timeout)?,
            warehouse_timeout: env_secs("QUERYLITE_WAREHOUSE_TIMEOUT_SECONDS", defaults.warehouse_timeout)?,
            max_rows: env_or("QUERYLITE_MAX_ROWS", defaults.max_rows)?,
            pool_size: env_or("QUERYLITE_POOL_SIZE", defaults.pool_size)?,
            max_overflow: env_or("QUERYLITE_POOL_MAX_OVERFLOW", defaults.max_overflow)?,
            checkout_timeout: env_secs("QUERYLITE_POOL_CHECKOUT_SECONDS", defaults.checkout_timeout)?,
            max_healing_attempts: env_or("QUERYLITE_MAX_HEALING_ATTEMPTS", defaults.max_healing_attempts)?,
            schema_ttl: env_secs("QUERYLITE_SCHEMA_TTL_SECONDS", defaults.schema_ttl)?,
            cache_ttl: env_secs("QUERYLITE_CACHE_TTL_SECONDS", defaults.cache_ttl)?,
            cache_capacity: env_or("QUERYLITE_CACHE_CAPACITY", defaults.cache_capacity)?,
            semantic_filter_threshold: env_or("QUERYLITE_SEMANTIC_FILTER_THRESHOLD", defaults.semantic_filter_threshold)?,
            semantic_top_k: env_or("QUERYLITE_SEMANTIC_TOP_K", defaults.semantic_top_k)?,
            history_max_turns: env_or("QUERYLITE_HISTORY_MAX_TURNS", defaults.history_max_turns)?,
            history_char_budget: env_or("QUERYLITE_HISTORY_CHAR_BUDGET", defaults.history_char_budget)?,
            donut_epsilon: env_or("QUERYLITE_DONUT_EPSILON", defaults.donut_epsilon)?,
            chart_sample_rows: env_or("QUERYLITE_CHART_SAMPLE_ROWS", defaults.chart_sample_rows)?,
            max_chart_columns: env_or("QUERYLITE_MAX_CHART_COLUMNS", defaults.max_chart_columns)?,
            maintenance_interval: env_secs("QUERYLITE_MAINTENANCE_INTERVAL_SECONDS", defaults.maintenance_interval)?,
            llm,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::Config(format!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.max_rows == 0 {
            return Err(EngineError::Config("max rows must be positive".to_string()));
        }
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool size must be positive".to_string()));
        }
        if self.max_healing_attempts == 0 {
            return Err(EngineError::Config(
                "max healing attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Connections a data source may hold at once.
    pub fn pool_capacity(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid value for {}: {:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity(), 15);
        assert_eq!(config.max_healing_attempts, 2);
        assert_eq!(config.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<u64>("QUERYLITE_MAX_ROWS", "many").unwrap_err();
        assert!(err.to_string().contains("QUERYLITE_MAX_ROWS"));
        assert_eq!(parse_value::<u64>("K", " 42 ").unwrap(), 42);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert!("bard".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = EngineConfig {
            confidence_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
