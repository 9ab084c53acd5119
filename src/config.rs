//! Tabprobe configuration module
//!
//! Persistent defaults live in `~/.config/tabprobe/config.toml`; evaluation
//! knobs come from environment variables.
//!
//! ## Priority order (highest to lowest)
//!
//! 1. Environment variables (`OPENAI_API_KEY`, `TABPROBE_*`)
//! 2. Config file (`~/.config/tabprobe/config.toml`)
//! 3. Defaults

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

/// Default per-node sandbox wall-clock limit (seconds)
const DEFAULT_NODE_TIMEOUT_SECS: u64 = 10;

/// Default critic-loop iteration cap per question
const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Default number of generated questions per run
const DEFAULT_QUESTION_COUNT: usize = 10;

/// Default cap on concurrently in-flight question loops
const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Grace period before a finished run is evicted from the registry
const DEFAULT_GRACE_SECS: u64 = 60;

/// Persistent file-backed configuration (provider defaults, API keys)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// API keys for LLM providers
    #[serde(default)]
    pub api_keys: ApiKeys,

    /// Default provider and model settings
    #[serde(default)]
    pub defaults: Defaults,
}

/// API keys configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKeys {
    /// OpenAI API key (sk-proj-... or sk-...)
    pub openai: Option<String>,
}

/// Default settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    /// Default provider (openai, mock)
    pub provider: Option<String>,

    /// Default model (gpt-4o, gpt-4o-mini, ...)
    pub model: Option<String>,
}

impl FileConfig {
    /// Get the config directory path
    ///
    /// Returns `~/.config/tabprobe/` on Unix, `%APPDATA%/tabprobe/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabprobe")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file
    ///
    /// Returns default config if file doesn't exist.
    /// Returns error if file exists but is malformed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| ProbeError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| ProbeError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    pub fn with_env(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.api_keys.openai = Some(key);
            }
        }
        if let Ok(model) = std::env::var("TABPROBE_MODEL") {
            if !model.is_empty() {
                self.defaults.model = Some(model);
            }
        }
        self
    }

    /// Get effective OpenAI API key
    pub fn openai_key(&self) -> Option<&str> {
        self.api_keys.openai.as_deref()
    }
}

/// Evaluation pipeline configuration
///
/// Everything the orchestrator, critic loop, and sandbox need to know about
/// limits and temperatures.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Provider name (openai, mock)
    pub provider: String,
    /// Model identifier passed to the provider
    pub model: String,
    /// Critic-loop iteration cap per question
    pub max_iterations: u32,
    /// Per-node sandbox wall-clock limit
    pub node_timeout: Duration,
    /// Number of questions requested from the generator
    pub question_count: usize,
    /// Cap on concurrently in-flight question loops
    pub max_concurrent: usize,
    /// Question generator temperature
    pub question_temperature: f32,
    /// DAG builder temperature
    pub builder_temperature: f32,
    /// Critic semantic-phase temperature
    pub critic_temperature: f32,
    /// Registry eviction grace period after the terminal event
    pub grace_period: Duration,
    /// Event queue capacity per run (oldest dropped beyond this)
    pub event_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            node_timeout: Duration::from_secs(DEFAULT_NODE_TIMEOUT_SECS),
            question_count: DEFAULT_QUESTION_COUNT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            question_temperature: 0.3,
            builder_temperature: 0.2,
            critic_temperature: 0.0,
            grace_period: Duration::from_secs(DEFAULT_GRACE_SECS),
            event_capacity: 1024,
        }
    }
}

impl ProbeConfig {
    /// Build from the file config plus `TABPROBE_*` environment overrides
    pub fn from_file_config(file: &FileConfig) -> Self {
        let mut cfg = Self::default();
        if let Some(p) = file.defaults.provider.as_deref() {
            cfg.provider = p.to_string();
        }
        if let Some(m) = file.defaults.model.as_deref() {
            cfg.model = m.to_string();
        }
        cfg.apply_env()
    }

    /// Apply `TABPROBE_*` environment overrides
    pub fn apply_env(mut self) -> Self {
        if let Some(n) = env_parse::<u32>("TABPROBE_MAX_ITERATIONS") {
            self.max_iterations = n;
        }
        if let Some(n) = env_parse::<u64>("TABPROBE_NODE_TIMEOUT_SECS") {
            self.node_timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_parse::<usize>("TABPROBE_QUESTION_COUNT") {
            self.question_count = n;
        }
        if let Some(n) = env_parse::<usize>("TABPROBE_MAX_CONCURRENT") {
            self.max_concurrent = n.max(1);
        }
        if let Ok(m) = std::env::var("TABPROBE_MODEL") {
            if !m.is_empty() {
                self.model = m;
            }
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Mask an API key for display
///
/// Shows first N chars + asterisks, e.g. "sk-proj-***"
pub fn mask_api_key(key: &str, visible_chars: usize) -> String {
    if key.is_empty() {
        return String::new();
    }

    let visible = key.len().min(visible_chars);
    format!("{}***", &key[..visible])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_contains_tabprobe() {
        let path = FileConfig::config_path();
        assert!(path.to_string_lossy().contains("tabprobe"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_default_probe_config() {
        let cfg = ProbeConfig::default();
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.node_timeout, Duration::from_secs(10));
        assert_eq!(cfg.question_count, 10);
        assert!((cfg.critic_temperature - 0.0).abs() < f32::EPSILON);
        assert!((cfg.builder_temperature - 0.2).abs() < f32::EPSILON);
        assert!((cfg.question_temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_file_config_toml_roundtrip() {
        let config = FileConfig {
            api_keys: ApiKeys {
                openai: Some("sk-test".into()),
            },
            defaults: Defaults {
                provider: Some("openai".into()),
                model: Some("gpt-4o-mini".into()),
            },
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[api_keys]"));
        assert!(toml_str.contains("openai = \"sk-test\""));
        let loaded: FileConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_env_overrides_file_config() {
        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let config = FileConfig {
            api_keys: ApiKeys {
                openai: Some("sk-from-file".into()),
            },
            ..Default::default()
        }
        .with_env();
        assert_eq!(config.openai_key(), Some("sk-from-env"));
        std::env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("sk-proj-abcdefghij", 7), "sk-proj***");
        assert_eq!(mask_api_key("short", 10), "short***");
        assert_eq!(mask_api_key("", 10), "");
    }
}
