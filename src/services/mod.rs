//! Ingestion-side services: payload assembly, upload, cleanup and the
//! workflow notification that closes a payload's lifecycle.

pub mod cleanup;
pub mod notification;
pub mod payload_assembler;
pub mod upload;

pub use cleanup::SpaceReclaimer;
pub use notification::{NotificationError, PayloadNotificationService};
pub use payload_assembler::{AccumulatorError, AssemblerSettings, PayloadAssembler};
pub use upload::{UploadError, UploadService, UploadSettings};
