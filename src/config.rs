use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const APP_NAME: &str = "kpls";
const DEFAULT_MODEL: &str = "llama3.1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_TYPED_LITERAL: &str = "yes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_OLLAMA_URL.to_string(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub typed_confirm_literal: String,
    pub preview_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub agent_step_timeout_secs: u64,
    pub agent_max_steps: usize,
    pub max_consecutive_corrections: u32,
    pub max_output_lines: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            typed_confirm_literal: DEFAULT_TYPED_LITERAL.to_string(),
            preview_timeout_secs: 8,
            exec_timeout_secs: 300,
            agent_step_timeout_secs: 8,
            agent_max_steps: crate::agent::DEFAULT_MAX_STEPS,
            max_consecutive_corrections: crate::correction::DEFAULT_MAX_CONSECUTIVE,
            max_output_lines: 100,
        }
    }
}

impl SafetyConfig {
    /// The word typed confirmation expects. A blank literal would let an
    /// empty line through, so it falls back to the default.
    pub fn typed_literal(&self) -> &str {
        let literal = self.typed_confirm_literal.trim();
        if literal.is_empty() {
            warn!("typed_confirm_literal is empty, using {:?}", DEFAULT_TYPED_LITERAL);
            DEFAULT_TYPED_LITERAL
        } else {
            literal
        }
    }

    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs(self.preview_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn agent_step_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_step_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub history_window: usize,
    pub record_history: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            record_history: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub safety: SafetyConfig,
    pub behavior: BehaviorConfig,
}

pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("config.toml")
}

pub fn load_config() -> Config {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("could not read {}: {}", path.display(), e);
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            warn!("ignoring invalid config {}: {}", path.display(), e);
            Config::default()
        }
    }
}

pub fn save_config(config: &Config) -> anyhow::Result<()> {
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &Config, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
