pub mod config;
pub mod export_config;
pub mod logging_config;
pub mod messaging_config;
pub mod retry_config;
pub mod storage_config;

pub use config::{Config, ConfigError, GatewayConfig};
pub use export_config::{
    DicomExportConfig, DicomWebAuth, DicomWebDestination, DicomWebExportConfig, ExportConfig,
    ExternalAppConfig, Hl7Destination, Hl7ExportConfig,
};
pub use logging_config::LoggingConfig;
pub use messaging_config::{MessagingConfig, TopicsConfig};
pub use retry_config::RetryConfig;
pub use storage_config::StorageConfig;

/// Structure representing application startup arguments or metadata.
#[derive(Debug)]
pub struct Cli {
    /// Path to the configuration file.
    pub config_path: String,
}

impl Cli {
    /// Creates a new `Cli` instance with the provided configuration path.
    pub fn new(config_path: String) -> Self {
        Self { config_path }
    }
}
