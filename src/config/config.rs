use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::config::{ExportConfig, LoggingConfig, MessagingConfig, StorageConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("gateway id cannot be empty")]
    InvalidGatewayId,
    #[error("watermark_percent must be between 1 and 100, got {0}")]
    InvalidWatermark(u8),
    #[error("{0} must be at least 1")]
    ZeroWorkers(String),
    #[error("{0}.delays_ms must contain at least one delay")]
    EmptyRetryDelays(String),
    #[error("destination '{name}' is invalid: {reason}")]
    InvalidDestination { name: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_id")]
    pub id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: default_gateway_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.id.trim().is_empty() {
            return Err(ConfigError::InvalidGatewayId);
        }
        self.storage.validate()?;
        self.messaging.validate()?;
        self.export.validate()?;
        Ok(())
    }
}

fn default_gateway_id() -> String {
    "imaging-gateway".to_string()
}
