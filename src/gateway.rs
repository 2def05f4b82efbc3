//! Wiring of the ingestion services and export pipelines into one process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{InMemoryBroker, MessageBroker};
use crate::config::Config;
use crate::export::{
    dicomweb_export_service, external_app_export_service, hl7_export_service, scu_export_service, ExportContext,
    ExportError, ExportHandle, PluginRegistry,
};
use crate::models::{FileRecord, Payload};
use crate::queue::WorkQueue;
use crate::services::{PayloadAssembler, PayloadNotificationService, SpaceReclaimer, UploadService};
use crate::storage::{AdmissionGate, FilesystemObjectStore, ObjectStore, StorageAdmission};

/// External collaborators the gateway runs against
pub struct GatewayContext {
    pub store: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub admission: Arc<dyn AdmissionGate>,
    pub plugins: PluginRegistry,
}

impl GatewayContext {
    /// Filesystem object store, in-memory broker and disk-backed admission
    pub fn standalone(config: &Config) -> anyhow::Result<Self> {
        let store = FilesystemObjectStore::new(&config.storage.storage_root)?;
        let admission = StorageAdmission::from_config(&config.storage)?;
        Ok(Self {
            store: Arc::new(store),
            broker: Arc::new(InMemoryBroker::new()),
            admission: Arc::new(admission),
            plugins: PluginRegistry::new(),
        })
    }
}

pub struct Gateway {
    config: Config,
    assembler: Arc<PayloadAssembler>,
    broker: Arc<dyn MessageBroker>,
    exports: Vec<Box<dyn ExportHandle>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Start every ingestion worker and each enabled export pipeline
    pub async fn start(config: Config, context: GatewayContext) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let uploads: WorkQueue<Arc<FileRecord>> = WorkQueue::new();
        let cleanup: WorkQueue<Arc<FileRecord>> = WorkQueue::new();
        let notifications: WorkQueue<Payload> = WorkQueue::new();
        let mut workers = Vec::new();

        let upload = Arc::new(UploadService::new(
            context.store.clone(),
            uploads.clone(),
            cleanup.clone(),
            (&config.storage).into(),
        ));
        workers.extend(upload.start(cancel.clone()));

        let reclaimer = Arc::new(SpaceReclaimer::new(&config.storage.temporary_data_dir, cleanup));
        workers.push(reclaimer.start(cancel.clone()));

        let notifier = Arc::new(PayloadNotificationService::new(
            context.broker.clone(),
            notifications.clone(),
            config.messaging.topics.workflow_request.clone(),
            config.storage.bucket.clone(),
            config.messaging.retries.clone(),
        ));
        workers.push(notifier.start(cancel.clone()));

        let (assembler, coordinator) = PayloadAssembler::start(
            (&config.storage).into(),
            context.admission.clone(),
            uploads,
            notifications,
            cancel.clone(),
        );
        workers.push(coordinator);

        let ctx = ExportContext {
            broker: context.broker.clone(),
            store: context.store.clone(),
            admission: context.admission.clone(),
            plugins: Arc::new(context.plugins),
            bucket: config.storage.bucket.clone(),
            retries: config.export.retries.clone(),
        };

        let mut gateway = Self {
            assembler,
            broker: context.broker,
            exports: Vec::new(),
            workers,
            cancel,
            config,
        };
        if let Err(e) = gateway.start_exports(ctx).await {
            gateway.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            "Gateway '{}' started with {} export pipelines",
            gateway.config.gateway.id,
            gateway.exports.len()
        );
        Ok(gateway)
    }

    async fn start_exports(&mut self, ctx: ExportContext) -> anyhow::Result<()> {
        let config = &self.config;
        if config.export.dicom.enabled {
            let service = scu_export_service(config, ctx.clone());
            service.start(&self.cancel).await?;
            self.exports.push(Box::new(service));
        }
        if config.export.dicomweb.enabled {
            let service = dicomweb_export_service(config, ctx.clone())?;
            service.start(&self.cancel).await?;
            self.exports.push(Box::new(service));
        }
        if config.export.hl7.enabled {
            let service = hl7_export_service(config, ctx.clone());
            service.start(&self.cancel).await?;
            self.exports.push(Box::new(service));
        }
        if config.export.external_app.enabled {
            let service = external_app_export_service(config, ctx);
            service.start(&self.cancel).await?;
            self.exports.push(Box::new(service));
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Entry point for producers handing over received files
    pub fn assembler(&self) -> &Arc<PayloadAssembler> {
        &self.assembler
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn export_services(&self) -> impl Iterator<Item = &str> {
        self.exports.iter().map(|service| service.name())
    }

    /// Drain the export pipelines within the configured timeout, then stop
    /// the ingestion workers.
    pub async fn shutdown(self) -> Vec<ExportError> {
        let timeout = self.config.export.shutdown_timeout();
        let mut errors = Vec::new();
        for service in &self.exports {
            if let Err(e) = service.stop(timeout).await {
                tracing::warn!("{}", e);
                errors.push(e);
            }
        }

        self.cancel.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Gateway worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Gateway '{}' stopped", self.config.gateway.id);
        errors
    }
}
