//! Northbound data pipeline
//!
//! Turns samples produced by protocol adapters into MQTT publishes, and holds
//! the read-only contexts that describe how each tag is published or written.

pub mod consumer;
pub mod envelope;
pub mod sample;

pub use consumer::{PublishSummary, SampleConsumer};
pub use envelope::{EnvelopeBuilder, JsonEnvelopeBuilder};
pub use sample::{DataPoint, Sample};

use crate::transport::{Qos, UserProperties};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How the data points of one sample are grouped into publishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageHandling {
    /// One publish per data point
    #[default]
    PerTag,
    /// All data points of a sample in one publish
    PerSubscription,
}

/// Read-only description of one northbound mapping
#[derive(Debug, Clone, PartialEq)]
pub struct PollingContext {
    pub tag_name: String,
    pub topic: String,
    pub qos: u8,
    pub message_handling: MessageHandling,
    pub include_timestamp: bool,
    pub include_tag_names: bool,
    pub user_properties: UserProperties,
}

impl PollingContext {
    /// Minimal context publishing `tag_name` to `topic` with QoS 0
    pub fn new(tag_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            topic: topic.into(),
            qos: 0,
            message_handling: MessageHandling::PerTag,
            include_timestamp: true,
            include_tag_names: false,
            user_properties: Vec::new(),
        }
    }

    /// Check the context before anything is published with it
    pub fn validate(&self) -> Result<Qos, PipelineError> {
        if self.topic.trim().is_empty() {
            return Err(PipelineError::InvalidContext(format!(
                "tag '{}' has no destination topic",
                self.tag_name
            )));
        }
        Qos::try_from(self.qos).map_err(|qos| {
            PipelineError::InvalidContext(format!(
                "tag '{}' has qos {qos}, expected 0, 1 or 2",
                self.tag_name
            ))
        })
    }
}

/// Read-only description of one southbound mapping
#[derive(Debug, Clone, PartialEq)]
pub struct WriteContext {
    pub tag_name: String,
    pub topic_filter: String,
    pub qos: u8,
    pub writing_interval: Duration,
    /// Negative means unlimited
    pub max_errors_before_removal: i64,
}

/// Pipeline failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Invalid polling context: {0}")]
    InvalidContext(String),

    #[error("Failed to build payload: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_handling_serde() {
        let handling: MessageHandling = serde_json::from_str("\"per-subscription\"").unwrap();
        assert_eq!(handling, MessageHandling::PerSubscription);
        assert_eq!(serde_json::to_string(&MessageHandling::PerTag).unwrap(), "\"per-tag\"");
        assert_eq!(MessageHandling::default(), MessageHandling::PerTag);
    }

    #[test]
    fn test_validate_accepts_valid_context() {
        let mut context = PollingContext::new("temperature", "plant/temperature");
        context.qos = 2;
        assert_eq!(context.validate(), Ok(Qos::ExactlyOnce));
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let context = PollingContext::new("temperature", "");
        assert!(matches!(
            context.validate(),
            Err(PipelineError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_validate_rejects_invalid_qos() {
        let mut context = PollingContext::new("temperature", "plant/temperature");
        context.qos = 3;
        let error = context.validate().unwrap_err();
        assert!(error.to_string().contains("qos 3"));
    }
}
