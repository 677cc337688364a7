//! Bridges a polling adapter into the scheduling engine
//!
//! One `AdapterSampler` exists per polling context of an adapter: it polls the
//! adapter for that context and hands the sample to its own consumer.

use super::sampler::{Sampler, SamplerDescriptor, SamplingFailure};
use crate::adapters::{AdapterError, PollingProtocolAdapter};
use crate::pipeline::{PollingContext, SampleConsumer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct AdapterSampler {
    adapter: Arc<dyn PollingProtocolAdapter>,
    context: PollingContext,
    consumer: SampleConsumer,
    descriptor: SamplerDescriptor,
}

impl AdapterSampler {
    pub fn new(
        adapter: Arc<dyn PollingProtocolAdapter>,
        context: PollingContext,
        consumer: SampleConsumer,
        descriptor: SamplerDescriptor,
    ) -> Self {
        Self {
            adapter,
            context,
            consumer,
            descriptor,
        }
    }

    pub fn context(&self) -> &PollingContext {
        &self.context
    }

    pub fn consumer(&self) -> &SampleConsumer {
        &self.consumer
    }
}

#[async_trait]
impl Sampler for AdapterSampler {
    /// Publish failures are accounted by the consumer and do not fail the poll
    async fn execute(&self) -> Result<(), AdapterError> {
        // A context that cannot be published is rejected before touching the device
        self.context.validate()?;
        let sample = self.adapter.poll(&self.context).await?;
        let summary = self.consumer.consume(&sample, &self.context).await?;
        debug!(
            adapter_id = %self.descriptor.adapter_id,
            tag_name = %self.context.tag_name,
            published = summary.succeeded,
            failed = summary.failed,
            "Sample processed"
        );
        Ok(())
    }

    fn descriptor(&self) -> &SamplerDescriptor {
        &self.descriptor
    }

    fn on_error(&self, failure: &SamplingFailure, continuing: bool) {
        debug!(
            adapter_id = %self.descriptor.adapter_id,
            tag_name = %self.context.tag_name,
            continuing,
            error = %failure,
            "Poll failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::pipeline::DataPoint;
    use crate::testing::{MockPollingAdapter, MockPublisher};
    use std::time::Duration;

    fn sampler(adapter: Arc<MockPollingAdapter>, publisher: Arc<MockPublisher>) -> AdapterSampler {
        let consumer = SampleConsumer::new("sim-1", "simulation", publisher, Arc::new(EventLog::new()));
        AdapterSampler::new(
            adapter,
            PollingContext::new("temperature", "plant/temperature"),
            consumer,
            SamplerDescriptor::new("sim-1", "simulation", Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_execute_polls_and_publishes() {
        let adapter = Arc::new(MockPollingAdapter::new(vec![DataPoint::new("temperature", 21.5)]));
        let publisher = Arc::new(MockPublisher::new());
        let sampler = sampler(Arc::clone(&adapter), Arc::clone(&publisher));

        sampler.execute().await.unwrap();

        assert_eq!(adapter.polls(), 1);
        assert_eq!(publisher.published().await.len(), 1);
        assert_eq!(sampler.consumer().publish_count(), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_is_returned() {
        let adapter = Arc::new(MockPollingAdapter::new(Vec::new()).failing_times(1));
        let publisher = Arc::new(MockPublisher::new());
        let sampler = sampler(Arc::clone(&adapter), Arc::clone(&publisher));

        let result = sampler.execute().await;

        assert!(matches!(result, Err(AdapterError::Communication(_))));
        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_execution() {
        let adapter = Arc::new(MockPollingAdapter::new(vec![DataPoint::new("temperature", 1)]));
        let sampler = sampler(adapter, Arc::new(MockPublisher::with_failure()));

        assert!(sampler.execute().await.is_ok());
        assert_eq!(sampler.consumer().publish_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_context_fails_before_polling() {
        // Arrange
        let adapter = Arc::new(MockPollingAdapter::new(vec![DataPoint::new("temperature", 1)]));
        let publisher = Arc::new(MockPublisher::new());
        let consumer = SampleConsumer::new("sim-1", "simulation", publisher.clone(), Arc::new(EventLog::new()));
        let mut context = PollingContext::new("temperature", "plant/temperature");
        context.qos = 5;
        let sampler = AdapterSampler::new(
            adapter.clone(),
            context,
            consumer,
            SamplerDescriptor::new("sim-1", "simulation", Duration::from_secs(1)),
        );

        // Act
        let result = sampler.execute().await;

        // Assert
        let error = result.unwrap_err();
        assert!(error.is_terminal());
        assert_eq!(adapter.polls(), 0);
        assert!(publisher.published().await.is_empty());
    }
}
