//! Sample consumer: envelopes a completed sample and publishes it
//!
//! Publishes of one sample are issued concurrently. A failed publish is counted
//! and logged but never aborts the others, and never turns the sample itself
//! into a failure.

use super::envelope::{EnvelopeBuilder, JsonEnvelopeBuilder};
use super::{PipelineError, PollingContext, Sample};
use crate::events::{Event, EventService, EventSeverity};
use crate::observability::metrics;
use crate::transport::{PublishRequest, Publisher, UserProperties};
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of publishing one sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Publishes the samples of one adapter subscription
pub struct SampleConsumer {
    adapter_id: String,
    protocol_id: String,
    publisher: Arc<dyn Publisher>,
    events: Arc<dyn EventService>,
    envelope_builder: Arc<dyn EnvelopeBuilder>,
    publish_count: AtomicU64,
}

impl SampleConsumer {
    pub fn new(
        adapter_id: impl Into<String>,
        protocol_id: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        events: Arc<dyn EventService>,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            protocol_id: protocol_id.into(),
            publisher,
            events,
            envelope_builder: Arc::new(JsonEnvelopeBuilder),
            publish_count: AtomicU64::new(0),
        }
    }

    /// Replace the default JSON envelope
    pub fn with_envelope_builder(mut self, envelope_builder: Arc<dyn EnvelopeBuilder>) -> Self {
        self.envelope_builder = envelope_builder;
        self
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Successful publishes since creation
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Envelope `sample` according to `context` and publish every payload
    ///
    /// Fails only when the context is invalid or the payloads cannot be built;
    /// in that case nothing is published.
    pub async fn consume(
        &self,
        sample: &Sample,
        context: &PollingContext,
    ) -> Result<PublishSummary, PipelineError> {
        let qos = context.validate()?;
        let payloads = self.envelope_builder.build(sample, context)?;

        if payloads.is_empty() {
            debug!(
                adapter_id = %self.adapter_id,
                tag_name = %context.tag_name,
                "Sample without data points, nothing to publish"
            );
            return Ok(PublishSummary::default());
        }

        let user_properties = merge_user_properties(&context.user_properties, &sample.user_properties);
        let requests: Vec<PublishRequest> = payloads
            .into_iter()
            .map(|payload| PublishRequest {
                topic: context.topic.clone(),
                qos,
                payload,
                retain: false,
                user_properties: user_properties.clone(),
                adapter_id: self.adapter_id.clone(),
            })
            .collect();

        let attempted = requests.len();
        let outcomes = join_all(requests.into_iter().map(|request| {
            let publisher = Arc::clone(&self.publisher);
            async move {
                let payload = request.payload.clone();
                (publisher.publish(request).await, payload)
            }
        }))
        .await;

        let mut summary = PublishSummary {
            attempted,
            ..PublishSummary::default()
        };

        for (result, payload) in outcomes {
            match result {
                Ok(()) => {
                    summary.succeeded += 1;
                    metrics().sample_published(&self.adapter_id);
                    if self.publish_count.fetch_add(1, Ordering::SeqCst) == 0 {
                        self.fire_first_publish_event(context, &payload);
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    metrics().sample_publish_failed(&self.adapter_id);
                    warn!(
                        adapter_id = %self.adapter_id,
                        protocol_id = %self.protocol_id,
                        topic = %context.topic,
                        error = %e,
                        "Failed to publish sample"
                    );
                }
            }
        }

        Ok(summary)
    }

    fn fire_first_publish_event(&self, context: &PollingContext, payload: &Bytes) {
        let payload_value = serde_json::from_slice(payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()));

        Event::adapter(&self.adapter_id, &self.protocol_id)
            .with_severity(EventSeverity::Info)
            .with_message(format!(
                "Adapter '{}' published its first sample to topic '{}'",
                self.adapter_id, context.topic
            ))
            .with_payload(payload_value)
            .fire(self.events.as_ref());
    }
}

/// Context properties first, then the sample's own
fn merge_user_properties(context: &UserProperties, sample: &UserProperties) -> UserProperties {
    context.iter().chain(sample.iter()).cloned().collect()
}
