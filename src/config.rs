use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Chat agent
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_agent_name")]
    pub default_agent_name: String,
    #[serde(default = "default_chat_context_limit")]
    pub chat_context_limit: usize,

    // Summary workflow scheduling
    #[serde(default = "default_enable_scheduler")]
    pub enable_summary_scheduler: bool,
    #[serde(default = "default_summary_interval")]
    pub summary_interval_secs: u64,
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    #[serde(default = "default_summary_history_cap")]
    pub summary_history_cap: usize,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. \
     You engage in meaningful conversations and help with tasks. \
     Keep your answers grounded in the conversation so far."
        .to_string()
}

fn default_agent_name() -> String {
    "default".to_string()
}

fn default_chat_context_limit() -> usize {
    20
}

fn default_enable_scheduler() -> bool {
    true
}

fn default_summary_interval() -> u64 {
    60
}

fn default_summary_window() -> usize {
    20
}

fn default_summary_history_cap() -> usize {
    10
}

fn default_database_path() -> String {
    "recap_memory.db".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            default_agent_name: default_agent_name(),
            chat_context_limit: default_chat_context_limit(),
            enable_summary_scheduler: default_enable_scheduler(),
            summary_interval_secs: default_summary_interval(),
            summary_window: default_summary_window(),
            summary_history_cap: default_summary_history_cap(),
            database_path: default_database_path(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("recap_config.toml")
    }

    /// Load config from recap_config.toml (next to executable)
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(name) = env::var("RECAP_DEFAULT_AGENT") {
            if !name.trim().is_empty() {
                config.default_agent_name = name;
            }
        }

        if let Ok(enabled) = env::var("RECAP_ENABLE_SUMMARY_SCHEDULER") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            config.enable_summary_scheduler = enabled;
        }

        if let Ok(interval) = env::var("RECAP_SUMMARY_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.summary_interval_secs = seconds;
            }
        }

        if let Ok(window) = env::var("RECAP_SUMMARY_WINDOW") {
            if let Ok(count) = window.parse() {
                config.summary_window = count;
            }
        }

        if let Ok(path) = env::var("RECAP_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        config
    }
}
