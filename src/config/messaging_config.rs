use serde::Deserialize;

use crate::config::{ConfigError, RetryConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub retries: RetryConfig,
}

/// Broker routing keys
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_workflow_request")]
    pub workflow_request: String,
    #[serde(default = "default_export_complete")]
    pub export_complete: String,
    /// Prefix of the per-agent export request topic, `{prefix}.{agent}`
    #[serde(default = "default_export_request_prefix")]
    pub export_request_prefix: String,
    #[serde(default = "default_export_hl7")]
    pub export_hl7: String,
    #[serde(default = "default_export_hl7_complete")]
    pub export_hl7_complete: String,
    #[serde(default = "default_external_app_request")]
    pub external_app_request: String,
    #[serde(default = "default_export_complete")]
    pub external_app_complete: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            workflow_request: default_workflow_request(),
            export_complete: default_export_complete(),
            export_request_prefix: default_export_request_prefix(),
            export_hl7: default_export_hl7(),
            export_hl7_complete: default_export_hl7_complete(),
            external_app_request: default_external_app_request(),
            external_app_complete: default_export_complete(),
        }
    }
}

impl TopicsConfig {
    pub fn export_request(&self, agent: &str) -> String {
        format!("{}.{}", self.export_request_prefix, agent)
    }
}

impl MessagingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let topics = [
            ("workflow_request", &self.topics.workflow_request),
            ("export_complete", &self.topics.export_complete),
            ("export_request_prefix", &self.topics.export_request_prefix),
            ("export_hl7", &self.topics.export_hl7),
            ("export_hl7_complete", &self.topics.export_hl7_complete),
            ("external_app_request", &self.topics.external_app_request),
            ("external_app_complete", &self.topics.external_app_complete),
        ];
        if let Some((name, _)) = topics.iter().find(|(_, topic)| topic.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "messaging.topics.{} cannot be empty",
                name
            )));
        }
        self.retries.validate("messaging.retries")
    }
}

fn default_workflow_request() -> String {
    "md.workflow.request".to_string()
}

fn default_export_complete() -> String {
    "md.export.complete".to_string()
}

fn default_export_request_prefix() -> String {
    "md.export.request".to_string()
}

fn default_export_hl7() -> String {
    "md.export.hl7".to_string()
}

fn default_export_hl7_complete() -> String {
    "md.export.hl7complete".to_string()
}

fn default_external_app_request() -> String {
    "md.externalapp.request".to_string()
}
