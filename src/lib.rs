pub mod broker;
pub mod config;
pub mod export;
pub mod gateway;
pub mod models;
pub mod queue;
pub mod retry;
pub mod services;
pub mod storage;

use anyhow::Context;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{Config, LoggingConfig};
pub use crate::gateway::{Gateway, GatewayContext};

/// Install the global subscriber: stdout, plus a file when configured
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level '{}'", logging.level))?;

    let stdout_appender = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let file_appender = if logging.log_to_file {
        let file = std::fs::File::create(&logging.log_file_path)
            .with_context(|| format!("unable to create log file '{}'", logging.log_file_path))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_appender)
        .with(file_appender)
        .try_init()
        .context("failed to initialize logging")
}

/// Run the gateway in standalone mode until Ctrl-C
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config.logging)?;

    tracing::info!("🔧 Starting imaging gateway '{}'", config.gateway.id);

    let context = GatewayContext::standalone(&config)?;
    let gateway = Gateway::start(config, context).await?;

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let errors = gateway.shutdown().await;
    if !errors.is_empty() {
        anyhow::bail!("{} export pipelines did not stop cleanly", errors.len());
    }
    Ok(())
}
