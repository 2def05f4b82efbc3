//! Dataset types for DIMSE operations

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::{DimseError, Result};

/// Offset of the "DICM" magic in a part-10 file (after the 128 byte preamble)
const PREAMBLE_LEN: usize = 128;
const DICM_MAGIC: &[u8; 4] = b"DICM";

/// An encoded DICOM object held in memory, with the details used in logs
#[derive(Debug, Clone)]
pub struct DatasetStream {
    /// Raw part-10 bytes
    data: Bytes,
    metadata: DatasetMetadata,
}

/// Metadata associated with a DICOM dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Unique identifier for this dataset
    pub id: Uuid,

    /// SOP Instance UID, when the caller knows it
    pub sop_instance_uid: Option<String>,

    /// Timestamp when dataset was received/created
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Size of the dataset in bytes
    pub size_bytes: Option<u64>,
}

/// Returns true when `data` carries the part-10 preamble and "DICM" prefix.
pub fn is_dicom_part10(data: &[u8]) -> bool {
    data.len() >= PREAMBLE_LEN + DICM_MAGIC.len()
        && &data[PREAMBLE_LEN..PREAMBLE_LEN + DICM_MAGIC.len()] == DICM_MAGIC
}

impl DatasetStream {
    /// Create a new in-memory dataset
    pub fn from_bytes(data: Bytes) -> Self {
        let mut metadata = DatasetMetadata::new();
        metadata.size_bytes = Some(data.len() as u64);
        Self { data, metadata }
    }

    /// Attach the SOP Instance UID used in logs
    pub fn with_sop_instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.metadata.sop_instance_uid = Some(uid.into());
        self
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Reject anything that is not a part-10 object before opening an association
    pub fn ensure_part10(&self) -> Result<()> {
        if is_dicom_part10(&self.data) {
            Ok(())
        } else {
            Err(DimseError::InvalidDataset(format!(
                "dataset {} is not a DICOM part-10 object",
                self.metadata.id
            )))
        }
    }

    /// Write the dataset to a temporary file in `temp_dir`, removed when the
    /// returned guard drops
    pub async fn materialize(&self, temp_dir: &Path) -> Result<MaterializedDataset> {
        let file = tempfile::Builder::new()
            .prefix("scu-")
            .suffix(".dcm")
            .tempfile_in(temp_dir)?;
        tokio::fs::write(file.path(), &self.data).await?;
        Ok(MaterializedDataset(file))
    }
}

/// A dataset path valid for the lifetime of this value
#[derive(Debug)]
pub struct MaterializedDataset(tempfile::NamedTempFile);

impl MaterializedDataset {
    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

impl DatasetMetadata {
    /// Create new metadata with a unique ID and current timestamp
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            sop_instance_uid: None,
            timestamp: chrono::Utc::now(),
            size_bytes: None,
        }
    }
}

impl Default for DatasetMetadata {
    fn default() -> Self {
        Self::new()
    }
}
