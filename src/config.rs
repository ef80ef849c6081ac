use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub model: String,
    pub base_url: String,
    /// Falls back to `ANTHROPIC_API_KEY` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub enable_caching: bool,
    pub request_timeout_secs: u64,
    /// Extra request fields sent with every call, e.g. `top_k`.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            model: std::env::var("PCA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            max_tokens: 65_536,
            temperature: 1.0,
            enable_caching: true,
            request_timeout_secs: 600,
            extra: Map::new(),
        }
    }
}

impl TransportConfig {
    /// Explicit key first, then the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// Workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub system_prompt: String,
    /// `{instruction}` is replaced with the task text.
    pub instruction_prompt: String,
    /// Step ceiling; 0 disables it.
    pub max_steps: usize,
    pub llm_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

const SYSTEM_PROMPT: &str = "You're a helpful coding agent. You will be given a task which you must complete.
Start by planning what needs to be done to complete the task.
At the end of your plan, output one bash command to execute at a time.
The command must be enclosed in triple backticks bash block.

If you have completed the task, output the following command in a triple
backticks bash block: COMPLETE_TASK";

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            system_prompt: SYSTEM_PROMPT.to_string(),
            instruction_prompt: "Task:\n{instruction}".to_string(),
            max_steps: 50,
            llm_timeout_secs: 600,
            command_timeout_secs: 180,
        }
    }
}

impl WorkflowConfig {
    pub fn render_instruction(&self, instruction: &str) -> String {
        self.instruction_prompt.replace("{instruction}", instruction)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

/// Unified configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub workflow: WorkflowConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pca")
            .join("config.toml")
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transport.max_tokens, 65_536);
        assert_eq!(config.transport.temperature, 1.0);
        assert!(config.transport.enable_caching);
        assert_eq!(config.workflow.max_steps, 50);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[transport]\nmodel = \"claude-haiku-4-5\"\nenable_caching = false\n\n[workflow]\nmax_steps = 7\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.model, "claude-haiku-4-5");
        assert!(!config.transport.enable_caching);
        assert_eq!(config.transport.max_tokens, 65_536);
        assert_eq!(config.workflow.max_steps, 7);
        assert!(config.workflow.system_prompt.contains("COMPLETE_TASK"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.workflow.command_timeout_secs = 5;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.workflow.command_timeout_secs, 5);
        assert_eq!(loaded.log.level, "info");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[transport\nmodel = ").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_transport_extra_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[transport]\nmodel = \"m\"\n\n[transport.extra]\ntop_k = 5\nstop_sequences = [\"STOP\"]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.extra["top_k"], serde_json::json!(5));
        assert_eq!(config.transport.extra["stop_sequences"], serde_json::json!(["STOP"]));
        assert!(Config::default().transport.extra.is_empty());
    }

    #[test]
    fn test_render_instruction() {
        let config = WorkflowConfig::default();
        assert_eq!(config.render_instruction("create file /tmp/x"), "Task:\ncreate file /tmp/x");
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = TransportConfig {
            api_key: Some("sk-explicit".into()),
            ..TransportConfig::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("sk-explicit"));
    }
}
