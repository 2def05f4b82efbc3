//! Configuration types for the DIMSE client

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::MAX_AE_TITLE_LEN;

/// Configuration for outbound DIMSE associations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScuConfig {
    /// Local (calling) Application Entity Title
    pub local_aet: String,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound for a whole association in milliseconds
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ScuConfig {
    fn default() -> Self {
        Self {
            local_aet: "GATEWAY_SCU".to_string(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
        }
    }
}

impl ScuConfig {
    /// Create a configuration with the given calling AE title and defaults
    pub fn new(local_aet: impl Into<String>) -> Self {
        Self {
            local_aet: local_aet.into(),
            ..Default::default()
        }
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.local_aet, "Local")?;

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.association_timeout_ms == 0 {
            return Err(DimseError::config(
                "Association timeout must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

fn validate_ae_title(title: &str, which: &str) -> Result<()> {
    if title.trim().is_empty() || title.len() > MAX_AE_TITLE_LEN {
        return Err(DimseError::InvalidAeTitle(format!(
            "{} AE title must be 1-{} characters, got '{}'",
            which, MAX_AE_TITLE_LEN, title
        )));
    }
    Ok(())
}

// Default value functions
fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}
