//! Configuration file and environment resolution.
//!
//! Precedence is flags > environment > config file > defaults. Flags and the
//! `ASK_*` variables are handled by clap; this module covers the file and the
//! provider API keys.

use log::{ info, warn };
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{ Path, PathBuf };
use thiserror::Error;

use crate::llm::LlmType;

const APP_DIR: &str = "ask";
const CONFIG_FILE: &str = "config.json";
const HISTORY_DB: &str = "history.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not determine the user config directory")]
    NoConfigDir,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub default_provider: String,
    /// `None` means the provider's first catalog model.
    pub default_model: Option<String>,
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: LlmType::OpenAI.to_string(),
            default_model: None,
            providers: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads `<config dir>/ask/config.json` if present and applies the
    /// environment. A broken file is reported and defaults are used instead.
    pub fn load() -> Self {
        let mut config = match config_path() {
            Some(path) if path.exists() =>
                Self::load_from(&path).unwrap_or_else(|e| {
                    warn!("config load failed: {}, using defaults", e);
                    Self::default()
                }),
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies `OPENAI_API_KEY`/`ANTHROPIC_API_KEY` and expands `${VAR}`
    /// references in file-provided keys.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for settings in self.providers.values_mut() {
            let reference = settings.api_key
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
                .map(str::to_string);
            if let Some(value) = reference.and_then(|var| lookup(&var)).filter(|v| !v.is_empty()) {
                settings.api_key = value;
            }
        }

        for ty in LlmType::ALL {
            if let Some(key) = lookup(ty.api_key_env()).filter(|v| !v.is_empty()) {
                self.providers.entry(ty.to_string()).or_default().api_key = key;
            }
        }
    }

    pub fn api_key(&self, provider: LlmType) -> Option<String> {
        self.providers
            .get(provider.as_str())
            .map(|p| p.api_key.clone())
            .filter(|k| !k.is_empty())
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Directory for history and other data, created on demand.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?.join(APP_DIR);
    fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

pub fn default_history_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join(HISTORY_DB))
}
