use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::workflow::stage::PipelineSpec;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub salesforce: SalesforceConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Declarative stage list. When absent the built-in NBA pipeline is used.
    #[serde(default)]
    pub pipeline: Option<PipelineSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Deserialize, Clone)]
pub struct SalesforceConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security_token: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

// Manual Debug impl to avoid leaking credentials
impl std::fmt::Debug for SalesforceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalesforceConfig")
            .field("login_url", &self.login_url)
            .field("api_version", &self.api_version)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("security_token", &"[REDACTED]")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

/// Connection parameters for one named capability provider.
#[derive(Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Anthropic {
        api_key: String,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default = "default_max_concurrency")]
        max_concurrency: usize,
    },
    #[serde(rename = "openai")]
    OpenAi {
        api_key: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default = "default_max_concurrency")]
        max_concurrency: usize,
    },
}

impl ProviderConfig {
    pub fn max_concurrency(&self) -> usize {
        match self {
            ProviderConfig::Anthropic {
                max_concurrency, ..
            }
            | ProviderConfig::OpenAi {
                max_concurrency, ..
            } => (*max_concurrency).max(1),
        }
    }
}

// Manual Debug impl to avoid leaking API keys
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderConfig::Anthropic {
                model,
                max_tokens,
                base_url,
                max_concurrency,
                ..
            } => f
                .debug_struct("Anthropic")
                .field("api_key", &"[REDACTED]")
                .field("model", model)
                .field("max_tokens", max_tokens)
                .field("base_url", base_url)
                .field("max_concurrency", max_concurrency)
                .finish(),
            ProviderConfig::OpenAi {
                model,
                base_url,
                max_concurrency,
                ..
            } => f
                .debug_struct("OpenAi")
                .field("api_key", &"[REDACTED]")
                .field("model", model)
                .field("base_url", base_url)
                .field("max_concurrency", max_concurrency)
                .finish(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// Provider used by the built-in pipeline's agents.
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// Total attempts per stage, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Cancel runs left waiting for a selection longer than this. Unbounded when unset.
    #[serde(default)]
    pub awaiting_input_ttl_secs: Option<u64>,
    /// Forget terminal runs older than this. Kept until discarded when unset.
    #[serde(default)]
    pub terminal_retention_secs: Option<u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            agent_timeout_secs: default_agent_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            awaiting_input_ttl_secs: None,
            terminal_retention_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl WorkflowConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_login_url() -> String {
    "https://login.salesforce.com".to_string()
}

fn default_api_version() -> String {
    "v59.0".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_openai_model() -> String {
    "gpt-4.1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_concurrency() -> usize {
    4
}

fn default_provider_name() -> String {
    "claude".to_string()
}

fn default_agent_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/tmp/nba-orchestrator-runs")
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(
                config::File::with_name("nba-orchestrator")
                    .required(false),
            );
        }

        // Environment variable overrides with NBA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("NBA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workflow.max_attempts == 0 {
            return Err(AppError::Config(
                "workflow.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.is_none() && !self.providers.contains_key(&self.workflow.default_provider)
        {
            return Err(AppError::Config(format!(
                "default provider '{}' is not configured under [providers]",
                self.workflow.default_provider
            )));
        }
        Ok(())
    }
}
