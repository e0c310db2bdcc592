// Mantis Configuration
//
// Store selection, collection names, default hyperparameters for new
// records and the size of the in-memory session working set.

use crate::types::Hyperparameters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MantisConfig {
    /// Document store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Collection names
    #[serde(default)]
    pub collections: CollectionsConfig,

    /// Hyperparameters written into newly created mantis records
    #[serde(default)]
    pub defaults: Hyperparameters,

    /// Session working set
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Document store backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store (nothing survives a restart)
    #[default]
    Memory,

    /// libSQL database file
    Libsql {
        /// Path to the database file
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsConfig {
    pub models: String,
    pub mantis: String,
    /// Collection holding training entities and their features
    pub entities: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            models: "models".to_string(),
            mantis: "mantis".to_string(),
            entities: "entities".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of users kept live in memory per session manager
    pub max_live_users: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_live_users: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter, overridden by RUST_LOG
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl MantisConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: MantisConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.defaults;
        if !(d.eps > 0.0) {
            return Err(ConfigError::ValidationError(
                "defaults: eps must be positive".to_string(),
            ));
        }
        if d.max_num_iters == 0 {
            return Err(ConfigError::ValidationError(
                "defaults: max_num_iters must be at least 1".to_string(),
            ));
        }
        if d.max_num_instances == 0 {
            return Err(ConfigError::ValidationError(
                "defaults: max_num_instances must be at least 1".to_string(),
            ));
        }

        if self.sessions.max_live_users == 0 {
            return Err(ConfigError::ValidationError(
                "sessions: max_live_users must be at least 1".to_string(),
            ));
        }

        let c = &self.collections;
        for (name, value) in [
            ("models", &c.models),
            ("mantis", &c.mantis),
            ("entities", &c.entities),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "collections: {} must not be empty",
                    name
                )));
            }
        }

        if let StoreConfig::Libsql { path } = &self.store {
            if path.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "store: libsql path must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
