pub mod events;
pub mod export;
pub mod file_record;
pub mod message;
pub mod payload;

pub use events::{ExportCompleteEvent, ExportRequestEvent, WorkflowRequestEvent};
pub use export::{ExportRequestDataMessage, ExportStatus, ExportTaskState, FileExportStatus};
pub use file_record::{DicomIdentity, FhirFormat, FileKind, FileRecord, StorageObject};
pub use message::Message;
pub use payload::{Payload, PayloadState, MAX_RETRY};
