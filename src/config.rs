//! Engine configuration.
//!
//! Loaded from a TOML file with environment-variable overrides (`dotenvy` +
//! `serde`), as a single `Config` struct with a sane `Default`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL for the OpenAI-compatible chat completions endpoint.
    pub llm_endpoint: String,
    /// Model name to request at that endpoint.
    pub llm_model: String,
    /// Path to the sqlite database backing persistence and auth storage.
    pub db_path: String,
    /// Hard ceiling on `max_iterations` regardless of complexity class.
    pub max_iterations_cap: u32,
    /// Per-tool-call timeout in seconds.
    pub tool_call_timeout_secs: u64,
    /// Default `max_retries` for a step that doesn't specify one.
    pub default_max_retries: u32,
}

impl Config {
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }

    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits (`#[serde(default)]` on the struct handles missing keys).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    /// Load `.env` (if present) then build a config from environment
    /// variables, falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Config::default();
        if let Ok(v) = std::env::var("ORKESTRA_LLM_ENDPOINT") {
            config.llm_endpoint = v;
        }
        if let Ok(v) = std::env::var("ORKESTRA_LLM_MODEL") {
            config.llm_model = v;
        }
        if let Ok(v) = std::env::var("ORKESTRA_DB_PATH") {
            config.db_path = v;
        }
        if let Ok(v) = std::env::var("ORKESTRA_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                config.max_iterations_cap = n;
            }
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_endpoint: "http://localhost:11434/v1".to_string(),
            llm_model: "qwen2.5:7b".to_string(),
            db_path: "orkestra.db".to_string(),
            max_iterations_cap: 10,
            tool_call_timeout_secs: 30,
            default_max_retries: 2,
        }
    }
}
