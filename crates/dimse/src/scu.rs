//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::{RemoteNode, ScuConfig};
use crate::types::DatasetStream;
use crate::{DimseError, Result};

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: ScuConfig,
    temp_dir: PathBuf,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: ScuConfig) -> Self {
        Self {
            config,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Directory used for datasets that must be written out before sending
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Send a C-STORE request to a remote node
    ///
    /// The dataset must be a part-10 object; anything else is rejected before
    /// an association is attempted.
    pub async fn store(&self, node: &RemoteNode, dataset: DatasetStream) -> Result<()> {
        info!(
            "Sending C-STORE to {} (dataset={}, sop={:?})",
            node,
            dataset.metadata().id,
            dataset.metadata().sop_instance_uid
        );
        node.validate()?;
        dataset.ensure_part10()?;

        #[cfg(feature = "dcmtk_cli")]
        {
            let materialized = dataset.materialize(&self.temp_dir).await?;
            let mut args = self.base_args(node);
            args.push(materialized.path().display().to_string());
            self.run_tool("storescu", args).await?;
            info!("C-STORE to {} completed successfully", node);
            Ok(())
        }

        #[cfg(not(feature = "dcmtk_cli"))]
        {
            Err(DimseError::NotSupported(
                "C-STORE requires feature 'dcmtk_cli'".into(),
            ))
        }
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    fn connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    #[cfg_attr(not(feature = "dcmtk_cli"), allow(dead_code))]
    fn base_args(&self, node: &RemoteNode) -> Vec<String> {
        let timeout_secs = self.connection_timeout(node).as_secs().max(1);
        vec![
            "-aet".into(),
            self.config.local_aet.clone(),
            "-aec".into(),
            node.ae_title.clone(),
            "-to".into(),
            timeout_secs.to_string(),
            "-pdu".into(),
            self.config.max_pdu.to_string(),
            node.host.clone(),
            node.port.to_string(),
        ]
    }

    #[cfg(feature = "dcmtk_cli")]
    async fn run_tool(&self, tool: &str, args: Vec<String>) -> Result<()> {
        use tokio::process::Command;

        debug!("Running: {} {}", tool, args.join(" "));
        let mut cmd = Command::new(tool);
        cmd.args(&args).kill_on_drop(true);

        let output = tokio::time::timeout(self.config.association_timeout(), cmd.output())
            .await
            .map_err(|_| {
                DimseError::Timeout(format!(
                    "{} did not finish within {:?}",
                    tool,
                    self.config.association_timeout()
                ))
            })?
            .map_err(|e| DimseError::operation_failed(format!("Failed to spawn {}: {}", tool, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        error!(
            "{} failed: status={:?}, stdout={}, stderr={}",
            tool,
            output.status.code(),
            stdout,
            stderr
        );
        Err(classify_failure(&stderr))
    }
}

/// Map DCMTK diagnostics onto the error variants callers retry on
#[cfg_attr(not(feature = "dcmtk_cli"), allow(dead_code))]
fn classify_failure(stderr: &str) -> DimseError {
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("unknown failure")
        .trim()
        .to_string();
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("association rejected") {
        DimseError::AssociationRejected(detail)
    } else if lower.contains("association aborted") {
        DimseError::AssociationAborted(detail)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        DimseError::Timeout(detail)
    } else if lower.contains("connection refused") || lower.contains("network") {
        DimseError::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            detail,
        ))
    } else {
        DimseError::operation_failed(detail)
    }
}
