//! Output data plugins applied to a file before delivery.
//!
//! Plugins are registered by name up front; export requests refer to them by
//! name and are applied in the order given.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::models::ExportRequestDataMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("output plugin '{0}' is not registered")]
    Unknown(String),
    #[error("output plugin '{plugin}' failed: {reason}")]
    Failed { plugin: String, reason: String },
}

#[async_trait]
pub trait OutputDataPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Transform `data` for the file described by `message`
    async fn execute(&self, message: &ExportRequestDataMessage, data: Bytes) -> Result<Bytes, PluginError>;
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn OutputDataPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` under its own name, replacing any previous one
    pub fn register(&mut self, plugin: Arc<dyn OutputDataPlugin>) -> &mut Self {
        self.plugins.insert(plugin.name().to_string(), plugin);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Look up every name, failing on the first unknown one
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn OutputDataPlugin>>, PluginError> {
        names
            .iter()
            .map(|name| {
                self.plugins
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PluginError::Unknown(name.clone()))
            })
            .collect()
    }

    /// Run the named plugins in order over `data`
    pub async fn apply(
        &self,
        names: &[String],
        message: &ExportRequestDataMessage,
        data: Bytes,
    ) -> Result<Bytes, PluginError> {
        let mut data = data;
        for plugin in self.resolve(names)? {
            data = plugin.execute(message, data).await?;
            tracing::debug!("Output plugin '{}' applied to {}", plugin.name(), message.file_id);
        }
        Ok(data)
    }
}
