//! Payload construction for outbound publishes
//!
//! A sample becomes one publish per data point, except in per-subscription mode
//! where a sample with several data points is combined into a single publish.

use super::{DataPoint, MessageHandling, PipelineError, PollingContext, Sample};
use bytes::Bytes;
use serde_json::{json, Map, Value};

/// Builds the serialized payloads for one sample
///
/// Implementations replace the default JSON layout; the number of payloads
/// returned is the number of publishes issued.
pub trait EnvelopeBuilder: Send + Sync {
    fn build(&self, sample: &Sample, context: &PollingContext) -> Result<Vec<Bytes>, PipelineError>;
}

/// Default JSON envelope
///
/// Single value: `{"timestamp": 1700000000000, "tagName": "t", "value": 21.5}`.
/// Combined: `{"timestamp": 1700000000000, "values": [{"tagName": "t", "value": 21.5}, ...]}`.
/// `timestamp` and `tagName` are only present when enabled on the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeBuilder;

impl JsonEnvelopeBuilder {
    fn point_object(point: &DataPoint, include_tag_names: bool) -> Map<String, Value> {
        let mut object = Map::new();
        if include_tag_names {
            object.insert("tagName".to_string(), Value::String(point.tag_name.clone()));
        }
        object.insert("value".to_string(), point.value.clone());
        object
    }

    fn serialize(mut object: Map<String, Value>, sample: &Sample, context: &PollingContext) -> Result<Bytes, PipelineError> {
        if context.include_timestamp {
            object.insert("timestamp".to_string(), json!(sample.timestamp.timestamp_millis()));
        }
        serde_json::to_vec(&Value::Object(object))
            .map(Bytes::from)
            .map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}

impl EnvelopeBuilder for JsonEnvelopeBuilder {
    fn build(&self, sample: &Sample, context: &PollingContext) -> Result<Vec<Bytes>, PipelineError> {
        let combine = context.message_handling == MessageHandling::PerSubscription
            && sample.data_points.len() > 1;

        if combine {
            let values: Vec<Value> = sample
                .data_points
                .iter()
                .map(|point| Value::Object(Self::point_object(point, context.include_tag_names)))
                .collect();
            let mut object = Map::new();
            object.insert("values".to_string(), Value::Array(values));
            return Ok(vec![Self::serialize(object, sample, context)?]);
        }

        sample
            .data_points
            .iter()
            .map(|point| {
                Self::serialize(
                    Self::point_object(point, context.include_tag_names),
                    sample,
                    context,
                )
            })
            .collect()
    }
}
