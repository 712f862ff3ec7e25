// Configuration for the annotation core

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Embedding cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resident embeddings with no outstanding references
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 8 }
    }
}

/// Mask engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidates scoring below this are dropped (the top candidate is always kept)
    pub min_confidence: f32,
    /// Default per-call backend timeout
    pub call_timeout_ms: u64,
    /// Upper bound on candidates returned from one prediction
    pub max_candidates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.1,
            call_timeout_ms: 30_000,
            max_candidates: 8,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_open_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_open_sessions: 64,
        }
    }
}

/// HTTP model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub sessions: SessionConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

impl StudioConfig {
    /// Load configuration from a TOML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration text, trying TOML first and then JSON
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let toml_err = match toml::from_str::<StudioConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        if let Ok(config) = serde_json::from_str::<StudioConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError(toml_err.to_string()))
    }

    /// Defaults overlaid with `SAMSTUDIO_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `SAMSTUDIO_*` environment variables onto this configuration
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SAMSTUDIO_CACHE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.cache.capacity = v;
        }
        if let Some(v) = var("SAMSTUDIO_MIN_CONFIDENCE").and_then(|v| v.parse().ok()) {
            self.engine.min_confidence = v;
        }
        if let Some(v) = var("SAMSTUDIO_CALL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.engine.call_timeout_ms = v;
        }
        if let Some(v) = var("SAMSTUDIO_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            self.sessions.max_open_sessions = v;
        }
        if let Some(v) = var("SAMSTUDIO_BACKEND_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = var("SAMSTUDIO_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.capacity must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.engine.min_confidence) {
            return Err(ConfigError::ValidationError(
                "engine.min_confidence must be between 0 and 1".to_string(),
            ));
        }

        if self.engine.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.call_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.engine.max_candidates == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_candidates must be > 0".to_string(),
            ));
        }

        if self.sessions.max_open_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.max_open_sessions must be > 0".to_string(),
            ));
        }

        if !self.backend.base_url.starts_with("http://") && !self.backend.base_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "backend.base_url must be an http(s) URL, got '{}'",
                self.backend.base_url
            )));
        }

        Ok(())
    }
}
