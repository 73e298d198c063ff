//! Service configuration.
//!
//! Defaults → optional TOML file → environment variables, in that order.
//! `DATABASE_URL` and `MEMORY_ACTIVE_PROJECT` have no sensible defaults and
//! must come from one of the latter two layers; startup fails with a clear
//! message otherwise.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string. Required.
    pub url: String,
    /// Queries slower than this are logged at WARN.
    pub slow_query_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: String::new(), slow_query_ms: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Tenant every query is scoped to. Required.
    pub active_project: String,
    /// Index used when a request names none.
    pub default_index: String,
    /// Root directory file reads are sandboxed under.
    pub root_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            active_project: String::new(),
            default_index: "default".to_string(),
            root_dir: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model driving the operation tool loops.
    pub agent_model: String,
    /// Cheaper model used for text analysis and chunk classification.
    pub analysis_model: String,
    pub agent_max_tokens: u32,
    pub analysis_max_tokens: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            agent_model: "gpt-4o".to_string(),
            analysis_model: "gpt-4o-mini".to_string(),
            agent_max_tokens: 16_384,
            analysis_max_tokens: 4_096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessTrackingConfig {
    pub enabled: bool,
    /// Only the first N results of a search are tracked.
    pub top_n: usize,
}

impl Default for AccessTrackingConfig {
    fn default() -> Self {
        Self { enabled: true, top_n: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub query_expansion_enabled: bool,
    /// Extra query variations generated per recall.
    pub query_expansion_count: usize,
    pub default_limit: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self { query_expansion_enabled: true, query_expansion_count: 2, default_limit: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimitsConfig {
    pub max_tool_iterations: usize,
    pub max_search_iterations: usize,
    /// Files at or above this size are analyzed in-process instead of being
    /// handed to the model through read_file.
    pub large_file_threshold_bytes: u64,
    /// Per-file read cap for the sandboxed loader.
    pub max_file_bytes: u64,
    /// Default action budget for refinement runs.
    pub refine_budget: usize,
}

impl Default for AgentLimitsConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            max_search_iterations: 3,
            large_file_threshold_bytes: 256 * 1024,
            max_file_bytes: 2 * 1024 * 1024,
            refine_budget: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub project: ProjectConfig,
    pub chat: ChatConfig,
    pub embedding: EmbeddingConfig,
    pub access_tracking: AccessTrackingConfig,
    pub recall: RecallConfig,
    pub limits: AgentLimitsConfig,
}

impl ServiceConfig {
    /// Load from an optional TOML file, then apply environment overrides,
    /// then check required values.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config = toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
        }
        config.apply_env();
        config.check_required()?;
        Ok(config)
    }

    /// Environment-only load for deployments without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.check_required()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_nonempty("DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = env_nonempty("MEMORY_ACTIVE_PROJECT") {
            self.project.active_project = value;
        }
        if let Some(value) = env_nonempty("MEMORY_PROJECT_ROOT") {
            self.project.root_dir = value;
        }
        if let Some(value) = env_parse("MEMORY_EMBEDDING_DIMENSIONS") {
            self.embedding.dimensions = value;
        }
        if let Some(value) = env_bool("MEMORY_ACCESS_TRACKING_ENABLED") {
            self.access_tracking.enabled = value;
        }
        if let Some(value) = env_parse("MEMORY_ACCESS_TRACKING_TOP_N") {
            self.access_tracking.top_n = value;
        }
        if let Some(value) = env_parse("MEMORY_SLOW_QUERY_MS") {
            self.database.slow_query_ms = value;
        }
        if let Some(value) = env_bool("MEMORY_QUERY_EXPANSION_ENABLED") {
            self.recall.query_expansion_enabled = value;
        }
        if let Some(value) = env_parse("MEMORY_QUERY_EXPANSION_COUNT") {
            self.recall.query_expansion_count = value;
        }
        if let Some(value) = env_parse("MEMORY_REFINE_BUDGET") {
            self.limits.refine_budget = value;
        }
        if let Some(value) = env_nonempty("MEMORY_CHAT_BASE_URL") {
            self.chat.base_url = value;
        }
        if let Some(value) = env_nonempty("MEMORY_CHAT_API_KEY") {
            self.chat.api_key = Some(value);
        }
        if let Some(value) = env_nonempty("MEMORY_CHAT_MODEL") {
            self.chat.agent_model = value;
        }
        if let Some(value) = env_nonempty("MEMORY_ANALYSIS_MODEL") {
            self.chat.analysis_model = value;
        }
        if let Some(value) = env_nonempty("MEMORY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = value;
        }
        if let Some(value) = env_nonempty("MEMORY_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(value);
        }
        if let Some(value) = env_nonempty("MEMORY_EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
    }

    fn check_required(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("DATABASE_URL is not set; export it or add [database] url to the config file");
        }
        if self.project.active_project.trim().is_empty() {
            bail!(
                "MEMORY_ACTIVE_PROJECT is not set; export it or add [project] active_project to the config file"
            );
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_nonempty(key).map(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}
