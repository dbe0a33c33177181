//! Engine configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::ChildOrder;

/// Default deepest level a project may sit at (roots are level 0)
pub const DEFAULT_MAX_DEPTH: u32 = 8;

/// Default number of entries kept in a session's transition log
pub const DEFAULT_HISTORY_SIZE: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("history_size must be at least 1")]
    EmptyHistory,
}

/// Tunables of a hierarchy session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest level a move may produce
    pub max_depth: u32,
    /// Sibling order used by builds and attaches
    pub child_order: ChildOrder,
    /// Number of transition log entries kept
    pub history_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            child_order: ChildOrder::default(),
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::EmptyHistory);
        }
        Ok(())
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}
