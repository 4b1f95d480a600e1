//! Engine Configuration
//!
//! Loaded from a JSON file or built in code. Everything except the project
//! and the acting principal has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_UNDO_CAPACITY: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_ECHO_TTL_MS: u64 = 5_000;
pub const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 1_500;
/// Levels are 0-based, so 2 allows three tiers
pub const DEFAULT_MAX_DEPTH: u8 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub project_id: String,
    /// Acting user (email), recorded on every write
    pub principal: String,
    pub undo_capacity: usize,
    /// Rows per remote write request
    pub batch_size: usize,
    pub echo_ttl_ms: u64,
    pub refresh_debounce_ms: u64,
    pub max_depth: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            principal: String::new(),
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            echo_ttl_ms: DEFAULT_ECHO_TTL_MS,
            refresh_debounce_ms: DEFAULT_REFRESH_DEBOUNCE_MS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn new(project_id: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            principal: principal.into(),
            ..Self::default()
        }
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id must not be empty".to_string()));
        }
        if self.principal.trim().is_empty() {
            return Err(ConfigError::Invalid("principal must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        // Levels are 0-based: at most three levels of groups
        if self.max_depth > DEFAULT_MAX_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "max_depth must be at most {}, got {}",
                DEFAULT_MAX_DEPTH, self.max_depth
            )));
        }
        Ok(())
    }

    pub fn echo_ttl(&self) -> Duration {
        Duration::from_millis(self.echo_ttl_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_undo_capacity(mut self, capacity: usize) -> Self {
        self.undo_capacity = capacity;
        self
    }
}
