//! DIMSE (DICOM Message Service Element) client
//!
//! This crate provides the Service Class User side the gateway needs to push
//! already-encoded DICOM part-10 objects to remote application entities.
//!
//! # Features
//! - Outbound C-STORE (SCU)
//! - DCMTK command line backend (feature = "dcmtk_cli", enabled by default)
//! - In-memory datasets written to temporary files for the CLI tools

pub mod config;
pub mod error;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{RemoteNode, ScuConfig};
pub use error::{DimseError, Result};
pub use scu::DimseScu;
pub use types::{is_dicom_part10, DatasetMetadata, DatasetStream};

/// Maximum length of an Application Entity title
pub const MAX_AE_TITLE_LEN: usize = 16;
