//! Forwarding to an external application over C-STORE.
//!
//! Delivery is identical to the DICOM export; the pipeline listens on its own
//! request topic and reports to its own completion topic.

use crate::config::Config;
use crate::export::{ExportContext, ExportService, ExportTopics, ScuTransport};

pub const EXTERNAL_APP_SERVICE: &str = "external-app";

pub fn external_app_export_service(config: &Config, ctx: ExportContext) -> ExportService<ScuTransport> {
    let topics = &config.messaging.topics;
    ExportService::new(
        EXTERNAL_APP_SERVICE,
        ScuTransport::from_config(&config.export.dicom, &config.storage.temporary_data_dir),
        ctx,
        ExportTopics {
            request: topics.external_app_request.clone(),
            complete: topics.external_app_complete.clone(),
        },
        config.export.external_app.max_associations,
    )
}
