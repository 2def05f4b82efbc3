use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use dimse::RemoteNode;

use crate::config::{ConfigError, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub dicom: DicomExportConfig,
    #[serde(default)]
    pub dicomweb: DicomWebExportConfig,
    #[serde(default)]
    pub hl7: Hl7ExportConfig,
    #[serde(default)]
    pub external_app: ExternalAppConfig,
}

/// C-STORE export; destinations are also used by the external app pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct DicomExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scu_agent")]
    pub agent_name: String,
    /// Calling AE title used for outbound associations
    #[serde(default = "default_ae_title")]
    pub ae_title: String,
    #[serde(default = "default_concurrency")]
    pub max_associations: usize,
    #[serde(default)]
    pub destinations: HashMap<String, RemoteNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DicomWebExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dicomweb_agent")]
    pub agent_name: String,
    #[serde(default = "default_concurrency")]
    pub max_connections: usize,
    #[serde(default = "default_dicomweb_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub destinations: HashMap<String, DicomWebDestination>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DicomWebDestination {
    /// Base URL of the DICOMweb service; STOW-RS posts to `{uri}/studies`
    pub uri: String,
    #[serde(default)]
    pub auth: Option<DicomWebAuth>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DicomWebAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hl7ExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub max_connections: usize,
    /// Bound on connect, send and ACK read, per attempt
    #[serde(default = "default_hl7_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub destinations: HashMap<String, Hl7Destination>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Hl7Destination {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub max_associations: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            retries: RetryConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            dicom: DicomExportConfig::default(),
            dicomweb: DicomWebExportConfig::default(),
            hl7: Hl7ExportConfig::default(),
            external_app: ExternalAppConfig::default(),
        }
    }
}

impl Default for DicomExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_name: default_scu_agent(),
            ae_title: default_ae_title(),
            max_associations: default_concurrency(),
            destinations: HashMap::new(),
        }
    }
}

impl Default for DicomWebExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_name: default_dicomweb_agent(),
            max_connections: default_concurrency(),
            timeout_secs: default_dicomweb_timeout_secs(),
            destinations: HashMap::new(),
        }
    }
}

impl Default for Hl7ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: default_concurrency(),
            timeout_secs: default_hl7_timeout_secs(),
            destinations: HashMap::new(),
        }
    }
}

impl Default for ExternalAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_associations: default_concurrency(),
        }
    }
}

impl DicomWebExportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Hl7ExportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExportConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retries.validate("export.retries")?;

        if self.dicom.agent_name.trim().is_empty() || self.dicomweb.agent_name.trim().is_empty() {
            return Err(ConfigError::Invalid("export agent_name cannot be empty".into()));
        }
        for (section, workers) in [
            ("export.dicom.max_associations", self.dicom.max_associations),
            ("export.dicomweb.max_connections", self.dicomweb.max_connections),
            ("export.hl7.max_connections", self.hl7.max_connections),
            ("export.external_app.max_associations", self.external_app.max_associations),
        ] {
            if workers == 0 {
                return Err(ConfigError::ZeroWorkers(section.to_string()));
            }
        }

        dimse::ScuConfig::new(self.dicom.ae_title.clone())
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("export.dicom.ae_title: {}", e)))?;

        for (name, node) in &self.dicom.destinations {
            node.validate().map_err(|e| ConfigError::InvalidDestination {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }
        for (name, destination) in &self.dicomweb.destinations {
            let parsed = url::Url::parse(&destination.uri).map_err(|e| {
                ConfigError::InvalidDestination {
                    name: name.clone(),
                    reason: format!("invalid uri '{}': {}", destination.uri, e),
                }
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidDestination {
                    name: name.clone(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        }
        for (name, destination) in &self.hl7.destinations {
            if destination.host.trim().is_empty() || destination.port == 0 {
                return Err(ConfigError::InvalidDestination {
                    name: name.clone(),
                    reason: "host and port are required".into(),
                });
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_scu_agent() -> String {
    "scu".to_string()
}

fn default_dicomweb_agent() -> String {
    "dicomweb".to_string()
}

fn default_ae_title() -> String {
    "GATEWAY_SCU".to_string()
}

fn default_concurrency() -> usize {
    2
}

fn default_dicomweb_timeout_secs() -> u64 {
    60
}

fn default_hl7_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}
