//! Configuration loading and validation
//!
//! Configuration lives in `agent.json`, found by walking upward from
//! the working directory. The schema is strict: unknown keys are
//! rejected so typos fail loudly at startup. A `.env` file next to the
//! config is loaded before the process environment is consulted, and
//! existing environment variables always win. The API key falls back
//! to the provider's conventional variable, then `OPENAI_API_KEY`.

use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration filename searched for
pub const CONFIG_FILENAME: &str = "agent.json";

/// Top-level configuration document. Exactly these keys are
/// recognized; anything else is a schema violation.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentFileConfig {
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion token cap
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Loop iteration cap
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// System prompt override
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// API key; falls back to the environment
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Provider base URL
    #[serde(default, rename = "baseURL")]
    pub base_url: Option<String>,
    /// Provider family: openai, openrouter, anthropic, ollama
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Skill discovery settings
    #[serde(default)]
    pub skill: SkillConfig,
    /// MCP servers to connect
    #[serde(default)]
    pub mcp: McpConfig,
    /// Memory store settings
    #[serde(default)]
    pub memory: MemorySettings,
    /// Knowledge directories indexed into the semantic store
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Permission rules
    #[serde(default)]
    pub permission: PermissionConfig,
    /// Guardrail / safety settings
    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_provider() -> String {
    "openai".to_string()
}

/// Skill discovery settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SkillConfig {
    /// Directories scanned for skill manifests
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    /// Load discovered skills automatically
    #[serde(default = "default_true")]
    pub auto_load: bool,
}

/// MCP client settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpConfig {
    /// Server name -> connection settings
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// One MCP server entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpServerConfig {
    /// Command to spawn for stdio transport
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// URL for HTTP transport
    #[serde(default)]
    pub url: Option<String>,
    /// Per-request timeout
    #[serde(default, with = "humantime_serde::option")]
    pub request_timeout: Option<Duration>,
}

/// Memory store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemorySettings {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Context budget for compaction
    #[serde(default)]
    pub max_context_tokens: Option<u64>,
    /// Embedding dimensionality of the semantic store
    #[serde(default)]
    pub embedding_dim: Option<usize>,
    /// Enable the semantic retrieval layer
    #[serde(default = "default_true")]
    pub semantic_search: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings {
            path: default_db_path(),
            max_context_tokens: None,
            embedding_dim: None,
            semantic_search: true,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("agentry.db")
}

/// Knowledge indexing settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
}

/// Permission rules
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionConfig {
    /// Evaluated in order; first match wins
    #[serde(default)]
    pub rules: Vec<PermissionRuleConfig>,
    /// Fallback for unmatched tools: allow, confirm, deny
    #[serde(default)]
    pub default_level: Option<String>,
    /// Remember confirmed tools for the session
    #[serde(default = "default_true")]
    pub session_memory: bool,
}

/// One configured permission rule
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionRuleConfig {
    pub tool_pattern: String,
    /// allow, confirm, deny
    pub level: String,
}

/// Guardrail and resource-safety settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityConfig {
    /// Severity at which guardrail failures block: info, warning,
    /// critical
    #[serde(default = "default_block_threshold")]
    pub block_threshold: String,
    /// Per-tool execution timeout
    #[serde(default = "default_tool_timeout", with = "humantime_serde")]
    pub tool_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            block_threshold: default_block_threshold(),
            tool_timeout: default_tool_timeout(),
        }
    }
}

fn default_block_threshold() -> String {
    "critical".to_string()
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// Walk upward from `start` looking for `agent.json`
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

/// Load configuration starting from the working directory. A missing
/// file yields the defaults (environment still applies).
pub fn load_config() -> Result<AgentFileConfig> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::Config(format!("Cannot determine working directory: {}", e)))?;
    match find_config(&cwd) {
        Some(path) => load_config_from_path(&path),
        None => {
            debug!("No {} found, using defaults", CONFIG_FILENAME);
            let mut config = AgentFileConfig {
                model: default_model(),
                provider: default_provider(),
                ..Default::default()
            };
            apply_env(&mut config);
            validate_config(&config)?;
            Ok(config)
        }
    }
}

/// Load configuration from a specific file
pub fn load_config_from_path(path: &Path) -> Result<AgentFileConfig> {
    // .env adjacent to the config loads first; existing process
    // variables are never overridden.
    if let Some(dir) = path.parent() {
        let dotenv = dir.join(".env");
        if dotenv.is_file() {
            let _ = dotenvy::from_path(&dotenv);
        }
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    let mut config: AgentFileConfig = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;

    apply_env(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Fill the API key from the environment when the file omits it
fn apply_env(config: &mut AgentFileConfig) {
    if config.api_key.is_none() {
        let provider_var = match config.provider.as_str() {
            "openrouter" => Some("OPENROUTER_API_KEY"),
            "anthropic" => Some("ANTHROPIC_API_KEY"),
            _ => None,
        };
        let key = provider_var
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        config.api_key = key.map(SecretString::from);
    }
}

/// Validate semantic constraints the schema cannot express
pub fn validate_config(config: &AgentFileConfig) -> Result<()> {
    if config.model.is_empty() {
        return Err(Error::Config("model must not be empty".into()));
    }
    if let Some(t) = config.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(Error::Config(format!(
                "temperature {} is outside [0, 2]",
                t
            )));
        }
    }
    if config.max_iterations == Some(0) {
        return Err(Error::Config("maxIterations must be at least 1".into()));
    }
    for rule in &config.permission.rules {
        if !matches!(rule.level.as_str(), "allow" | "confirm" | "deny") {
            return Err(Error::Config(format!(
                "permission level \"{}\" must be allow, confirm or deny",
                rule.level
            )));
        }
    }
    if !matches!(
        config.security.block_threshold.as_str(),
        "info" | "warning" | "critical"
    ) {
        return Err(Error::Config(format!(
            "blockThreshold \"{}\" must be info, warning or critical",
            config.security.block_threshold
        )));
    }
    Ok(())
}
