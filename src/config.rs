//! Configuration loading and validation.

use crate::advisor::content_filter::{DEFAULT_BLOCKED_TERMS, DEFAULT_REFUSAL};
use crate::conversation::window::{
    DEFAULT_MAX_CONVERSATIONS, EPHEMERAL_WINDOW_SIZE, PERSISTENT_WINDOW_SIZE,
};
use crate::error::{ConfigError, Result};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Convo configuration.
///
/// Layered as built-in defaults, then an optional TOML file, then `CONVO_*`
/// environment variables (`CONVO_LLM__MODEL` sets `llm.model`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub advisors: AdvisorConfig,
    pub llm: LlmConfig,
    pub prompt: PromptConfig,
}

/// Durable history storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL. Defaults to `convo.db` inside the data directory.
    pub url: Option<String>,
    pub max_connections: u32,
    /// History table name.
    pub table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            table: crate::conversation::history::DEFAULT_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Recent turns kept per conversation and sent to the model.
    /// Defaults to 20 with persistence and 10 without.
    pub window_size: Option<usize>,
    /// Off runs window-only: nothing survives a restart.
    pub persist: bool,
    /// Conversations whose windows stay in memory at once.
    pub max_cached_conversations: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: None,
            persist: true,
            max_cached_conversations: DEFAULT_MAX_CONVERSATIONS,
        }
    }
}

impl MemoryConfig {
    pub fn window_size(&self) -> usize {
        match self.window_size {
            Some(size) => size,
            None if self.persist => PERSISTENT_WINDOW_SIZE,
            None => EPHEMERAL_WINDOW_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub blocked_terms: Vec<String>,
    pub refusal: String,
    pub log_requests: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            blocked_terms: DEFAULT_BLOCKED_TERMS.iter().map(|term| term.to_string()).collect(),
            refusal: DEFAULT_REFUSAL.to_string(),
            log_requests: true,
        }
    }
}

/// Model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// Longest wait between fragments. Zero disables the limit.
    pub fragment_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            connect_timeout_secs: 10,
            fragment_timeout_secs: 60,
        }
    }
}

/// System-role prompt settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Template source. Without one, [`DEFAULT_SYSTEM_TEMPLATE`](crate::prompts::DEFAULT_SYSTEM_TEMPLATE)
    /// is used as soon as any variable is set.
    pub system_template: Option<String>,
    pub variables: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("convo"))
            .unwrap_or_else(|| PathBuf::from("./data"));

        Self {
            data_dir,
            database: DatabaseConfig::default(),
            memory: MemoryConfig::default(),
            advisors: AdvisorConfig::default(),
            llm: LlmConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let layered = builder
            .add_source(
                config::Environment::with_prefix("CONVO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(ConfigError::from)?;

        let mut config: Config = layered.try_deserialize().map_err(ConfigError::from)?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.window_size() == 0 {
            return Err(ConfigError::Invalid("memory.window_size must be at least 1".into()).into());
        }
        if self.memory.max_cached_conversations == 0 {
            return Err(ConfigError::Invalid(
                "memory.max_cached_conversations must be at least 1".into(),
            )
            .into());
        }
        if self.database.max_connections == 0 {
            return Err(
                ConfigError::Invalid("database.max_connections must be at least 1".into()).into(),
            );
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::MissingKey("llm.model".into()).into());
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::MissingKey("llm.base_url".into()).into());
        }
        Ok(())
    }

    /// SQLite URL, creating the data directory when the default location is used.
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.database.url {
            return Ok(url.clone());
        }

        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!(
                "failed to create data directory: {}",
                self.data_dir.display()
            )
        })?;
        Ok(format!("sqlite://{}", self.sqlite_path().display()))
    }

    /// Get the SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("convo.db")
    }

    /// Rendered system prompt, if one is configured.
    pub fn system_prompt(&self) -> Result<Option<String>> {
        let template = match &self.prompt.system_template {
            Some(template) => template.as_str(),
            None if !self.prompt.variables.is_empty() => crate::prompts::DEFAULT_SYSTEM_TEMPLATE,
            None => return Ok(None),
        };

        crate::prompts::render_system_prompt(template, &self.prompt.variables).map(Some)
    }

    pub fn fragment_timeout(&self) -> Option<Duration> {
        (self.llm.fragment_timeout_secs > 0)
            .then(|| Duration::from_secs(self.llm.fragment_timeout_secs))
    }

    /// Effective configuration as TOML, without secrets.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|error| ConfigError::Invalid(error.to_string()).into())
    }
}
