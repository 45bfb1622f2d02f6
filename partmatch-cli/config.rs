use partmatch_core::MatchPolicy;
use partmatch_match::MatcherConfig;
use partmatch_sift::SiftConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::store::StorePaths;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the hosted multimodal model strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the bearer token
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Catalog rows listed in the prompt
    pub max_catalog_items: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            max_catalog_items: 200,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which analyzer answers queries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// SIFT matching against the feature store
    #[default]
    Local,
    Remote(RemoteConfig),
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; the CPU count when unset
    pub threads: Option<usize>,
    /// Extraction settings for query images
    pub sift: SiftConfig,
    /// Extraction settings for offline indexing
    pub indexing: IndexingConfig,
    pub matcher: MatcherConfig,
    pub policy: MatchPolicy,
    pub store: StorePaths,
    pub strategy: StrategyConfig,
}

/// Offline indexing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub sift: SiftConfig,
    /// Images with these extensions are indexed, compared case-insensitively
    pub extensions: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            sift: SiftConfig::indexing_preset(),
            extensions: vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()],
        }
    }
}

impl EngineConfig {
    /// Load from a `.json` or TOML file and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let config = if is_json { Self::from_json(&text)? } else { Self::from_toml(&text)? };
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sift.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.indexing.sift.validate().map_err(|e| ConfigError::Invalid(format!("indexing: {}", e)))?;
        self.matcher.validate().map_err(ConfigError::Invalid)?;
        self.policy.validate().map_err(ConfigError::Invalid)?;

        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be at least 1".to_string()));
        }
        if let StrategyConfig::Remote(remote) = &self.strategy {
            if remote.endpoint.is_empty() {
                return Err(ConfigError::Invalid("remote endpoint is empty".to_string()));
            }
            if remote.timeout_secs == 0 {
                return Err(ConfigError::Invalid("remote timeout_secs must be positive".to_string()));
            }
        }
        Ok(())
    }
}
