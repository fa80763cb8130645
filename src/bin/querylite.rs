//! querylite CLI
//!
//! Run with: cargo run --bin querylite -- ask --source local-file --file orders=data/orders.csv "revenue by region"

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use querylite_engine::config::ProviderKind;
use querylite_engine::connectors::{ConnectionConfig, DataSourceHandle};
use querylite_engine::engine::{AskRequest, QueryEngine};
use querylite_engine::llm::{provider_from_settings, DUMMY_API_KEY};
use querylite_engine::observability::init_logging;
use querylite_engine::EngineConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "querylite")]
#[command(about = "Ask questions of a database in natural language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate, validate and run a query for a question
    Ask {
        #[command(flatten)]
        source: SourceArgs,

        /// The question in natural language
        question: String,

        /// Run the query even when the model is unsure
        #[arg(long)]
        confirm: bool,

        /// Execution timeout in seconds (defaults to the source's bound)
        #[arg(long)]
        timeout: Option<u64>,

        /// LLM provider (openai, anthropic, ollama); overrides QUERYLITE_LLM_PROVIDER
        #[arg(long)]
        provider: Option<String>,

        /// Provider API key; falls back to the environment, then offline mode
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Check that a data source is reachable and list its tables
    TestConnection {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    Postgres,
    LocalFile,
    /// Any connection described by a JSON file
    Config,
}

#[derive(Args)]
struct SourceArgs {
    /// Kind of data source
    #[arg(long, value_enum)]
    source: SourceKind,

    /// Connection URL for postgres sources
    #[arg(long)]
    url: Option<String>,

    /// Table file for local-file sources, as name=path (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,

    /// JSON connection description for config sources
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identifier used for caching and logs
    #[arg(long, default_value = "default")]
    id: String,
}

impl SourceArgs {
    fn connection_config(&self) -> Result<ConnectionConfig> {
        match self.source {
            SourceKind::Postgres => {
                let url = self
                    .url
                    .clone()
                    .or_else(|| std::env::var("DATABASE_URL").ok())
                    .ok_or_else(|| anyhow!("--url or DATABASE_URL is required for postgres sources"))?;
                Ok(ConnectionConfig::Postgres { url })
            }
            SourceKind::LocalFile => {
                let mut tables = BTreeMap::new();
                for spec in &self.files {
                    let (name, path) = spec
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--file expects name=path, got {}", spec))?;
                    tables.insert(name.trim().to_string(), PathBuf::from(path.trim()));
                }
                if tables.is_empty() {
                    return Err(anyhow!("at least one --file is required for local-file sources"));
                }
                Ok(ConnectionConfig::LocalFile { tables })
            }
            SourceKind::Config => {
                let path = self
                    .config
                    .as_ref()
                    .ok_or_else(|| anyhow!("--config is required for config sources"))?;
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
            }
        }
    }

    fn connect(&self, config: &EngineConfig) -> Result<DataSourceHandle> {
        Ok(DataSourceHandle::connect(
            self.id.clone(),
            self.connection_config()?,
            config,
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;

    match cli.command {
        Command::Ask {
            source,
            question,
            confirm,
            timeout,
            provider,
            api_key,
        } => {
            if let Some(provider) = provider {
                let kind: ProviderKind = provider.parse()?;
                if kind != config.llm.provider {
                    let key = std::mem::take(&mut config.llm.api_key);
                    config.llm = querylite_engine::config::LlmSettings::for_provider(kind);
                    config.llm.api_key = key;
                }
            }
            if let Some(key) = api_key {
                config.llm.api_key = key;
            }
            if config.llm.api_key.is_empty() && config.llm.provider != ProviderKind::Ollama {
                info!("No API key configured; running in offline mode");
                config.llm.api_key = DUMMY_API_KEY.to_string();
            }

            let handle = source.connect(&config)?;
            let provider = provider_from_settings(&config.llm)?;
            let engine = QueryEngine::new(config, provider)?;

            let mut request = AskRequest::new(question);
            request.confirmed = confirm;
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }

            let outcome = engine.ask(&handle, request).await;
            handle.close().await;
            match outcome {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(e) => {
                    let body = serde_json::json!({"error": e.tag(), "message": e.to_string()});
                    println!("{}", serde_json::to_string_pretty(&body)?);
                    std::process::exit(1);
                }
            }
        }
        Command::TestConnection { source } => {
            let handle = source.connect(&config)?;
            let test = handle.connector().test().await;
            handle.close().await;
            println!("{}", serde_json::to_string_pretty(&test)?);
            if !test.ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
