//! Gateway node lifecycle
//!
//! The node owns the shared executor, both schedulers and the outbound queue.
//! Starting an adapter registers one sampler per polling subscription and one
//! drain task per write subscription; stopping it removes all of them. Inbound
//! messages from write topics are routed into the matching queues.

use crate::adapters::{create_adapter, AdapterInstance};
use crate::config::{AdapterConfig, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{Event, EventLog, EventSeverity};
use crate::lifecycle_span;
use crate::observability::metrics;
use crate::pipeline::{PollingContext, SampleConsumer};
use crate::polling::{AdapterSampler, PollingScheduler, SamplerDescriptor, SamplerId};
use crate::scheduling::{ScheduledExecutor, SchedulingSettings};
use crate::transport::mqtt::MessageHandler;
use crate::transport::{InboundMessage, Publisher, Qos, Transport};
use crate::writing::{DrainKey, InMemoryOutboundQueue, QueueDrainScheduler};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// One write subscription of a running adapter
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSubscription {
    pub adapter_id: String,
    pub tag_name: String,
    pub topic_filter: String,
    pub qos: Qos,
    pub queue_id: String,
}

struct RunningAdapter {
    protocol_id: String,
    samplers: Vec<SamplerId>,
    drains: Vec<DrainKey>,
    write_subscriptions: Vec<WriteSubscription>,
}

pub struct GatewayNode {
    config: GatewayConfig,
    events: Arc<EventLog>,
    publisher: Arc<dyn Publisher>,
    queue: Arc<InMemoryOutboundQueue>,
    polling: PollingScheduler,
    draining: QueueDrainScheduler,
    adapters: DashMap<String, RunningAdapter>,
}

impl GatewayNode {
    /// Create a node on the current tokio runtime
    pub fn new(config: GatewayConfig, publisher: Arc<dyn Publisher>, events: Arc<EventLog>) -> Self {
        let settings = SchedulingSettings::from(&config.scheduling);
        let executor = ScheduledExecutor::new();
        let queue = Arc::new(InMemoryOutboundQueue::new());

        let polling = PollingScheduler::new(Arc::clone(&executor), settings.clone(), events.clone());
        let draining = QueueDrainScheduler::new(executor, settings, events.clone(), queue.clone());

        Self {
            config,
            events,
            publisher,
            queue,
            polling,
            draining,
            adapters: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn queue(&self) -> &Arc<InMemoryOutboundQueue> {
        &self.queue
    }

    pub fn polling(&self) -> &PollingScheduler {
        &self.polling
    }

    pub fn draining(&self) -> &QueueDrainScheduler {
        &self.draining
    }

    /// Start every configured adapter; one failing adapter does not stop the others
    pub fn start_all(&self) -> Vec<(String, GatewayError)> {
        let mut failures = Vec::new();
        for adapter in &self.config.adapters {
            if let Err(e) = self.start_adapter(&adapter.id) {
                warn!(adapter_id = %adapter.id, error = %e, "Failed to start adapter");
                failures.push((adapter.id.clone(), e));
            }
        }
        metrics().set_node_state("running");
        failures
    }

    /// Start one configured adapter
    pub fn start_adapter(&self, adapter_id: &str) -> GatewayResult<()> {
        let config = self
            .config
            .adapter(adapter_id)
            .ok_or_else(|| GatewayError::UnknownAdapter(adapter_id.to_string()))?;

        // The slot stays reserved until scheduling is done, so concurrent starts of
        // the same adapter cannot both schedule it
        let slot = match self.adapters.entry(adapter_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::AdapterAlreadyStarted(adapter_id.to_string()));
            }
            Entry::Vacant(slot) => slot,
        };

        // Contexts are checked before anything is scheduled
        let polling_contexts = config.polling_contexts();
        for context in &polling_contexts {
            context.validate()?;
        }

        let instance = create_adapter(config)
            .map_err(|e| GatewayError::adapter_failed(adapter_id, e.to_string()))?;
        if !config.writing.is_empty() && instance.writing.is_none() {
            return Err(GatewayError::adapter_failed(
                adapter_id,
                format!("protocol '{}' does not support writing", config.protocol),
            ));
        }

        let span = lifecycle_span!(adapter_id = %adapter_id, protocol_id = %config.protocol);
        let _guard = span.enter();

        let running = self.schedule_adapter(config, instance, polling_contexts);
        info!(
            samplers = running.samplers.len(),
            drains = running.drains.len(),
            "Adapter started"
        );

        Event::adapter(adapter_id, &config.protocol)
            .with_severity(EventSeverity::Info)
            .with_message(format!("Adapter '{adapter_id}' started"))
            .fire(self.events.as_ref());

        slot.insert(running);
        Ok(())
    }

    fn schedule_adapter(
        &self,
        config: &AdapterConfig,
        instance: AdapterInstance,
        polling_contexts: Vec<PollingContext>,
    ) -> RunningAdapter {
        let mut samplers = Vec::with_capacity(polling_contexts.len());
        for context in polling_contexts {
            let consumer = SampleConsumer::new(
                &config.id,
                &config.protocol,
                Arc::clone(&self.publisher),
                self.events.clone(),
            );
            let descriptor = SamplerDescriptor::new(&config.id, &config.protocol, config.polling_interval())
                .with_initial_delay(config.initial_delay())
                .with_max_errors_before_removal(config.max_polling_errors_before_removal);
            let sampler = AdapterSampler::new(Arc::clone(&instance.polling), context, consumer, descriptor);
            samplers.push(self.polling.schedule(Arc::new(sampler)));
        }

        let mut drains = Vec::new();
        let mut write_subscriptions = Vec::new();
        if let Some(writer) = &instance.writing {
            for context in config.write_contexts() {
                let qos = Qos::try_from(context.qos).unwrap_or(Qos::AtLeastOnce);
                let topic_filter = context.topic_filter.clone();
                let tag_name = context.tag_name.clone();

                let key = Arc::clone(writer).schedule_drain(&self.draining, context);
                write_subscriptions.push(WriteSubscription {
                    adapter_id: config.id.clone(),
                    tag_name,
                    topic_filter,
                    qos,
                    queue_id: key.queue_id.clone(),
                });
                drains.push(key);
            }
        }

        RunningAdapter {
            protocol_id: config.protocol.clone(),
            samplers,
            drains,
            write_subscriptions,
        }
    }

    /// Stop all samplers and drain tasks of one adapter
    pub fn stop_adapter(&self, adapter_id: &str) -> GatewayResult<()> {
        let (_, running) = self
            .adapters
            .remove(adapter_id)
            .ok_or_else(|| GatewayError::UnknownAdapter(adapter_id.to_string()))?;

        let samplers = self.polling.stop_for_adapter(adapter_id);
        let drains = self.draining.stop_for_adapter(adapter_id);
        info!(adapter_id = %adapter_id, samplers, drains, "Adapter stopped");

        Event::adapter(adapter_id, &running.protocol_id)
            .with_severity(EventSeverity::Info)
            .with_message(format!("Adapter '{adapter_id}' stopped"))
            .fire(self.events.as_ref());
        Ok(())
    }

    pub fn is_running(&self, adapter_id: &str) -> bool {
        self.adapters.contains_key(adapter_id)
    }

    pub fn running_adapters(&self) -> Vec<String> {
        self.adapters.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Write subscriptions of all running adapters
    pub fn write_subscriptions(&self) -> Vec<WriteSubscription> {
        self.adapters
            .iter()
            .flat_map(|entry| entry.value().write_subscriptions.clone())
            .collect()
    }

    /// Subscribe the transport to every write topic filter
    pub async fn subscribe_write_topics<T: Transport>(&self, transport: &T) -> GatewayResult<()> {
        for subscription in self.write_subscriptions() {
            transport
                .subscribe(&subscription.topic_filter, subscription.qos)
                .await
                .map_err(|e| {
                    GatewayError::adapter_failed(
                        &subscription.adapter_id,
                        format!("subscribing to '{}' failed: {e}", subscription.topic_filter),
                    )
                })?;
        }
        Ok(())
    }

    /// Enqueue an inbound message into every write subscription it matches
    ///
    /// Returns the number of queues the message was added to.
    pub fn route_inbound(&self, message: &InboundMessage) -> usize {
        let mut routed = 0;
        for subscription in self.write_subscriptions() {
            if !MessageHandler::topic_matches(&subscription.topic_filter, &message.topic) {
                continue;
            }
            match self.queue.enqueue(
                &subscription.queue_id,
                message.topic.clone(),
                message.payload.clone(),
                message.qos,
            ) {
                Ok(message_id) => {
                    routed += 1;
                    debug!(queue_id = %subscription.queue_id, message_id = %message_id, "Inbound message queued");
                }
                Err(e) => {
                    warn!(queue_id = %subscription.queue_id, error = %e, "Dropping inbound message");
                    metrics().message_dropped(&subscription.adapter_id);
                }
            }
        }

        if routed == 0 {
            debug!(topic = %message.topic, "Inbound message matched no write subscription");
        }
        routed
    }

    /// Route inbound messages until the channel closes
    pub async fn run_inbound(self: Arc<Self>, mut receiver: mpsc::Receiver<InboundMessage>) {
        let span = lifecycle_span!(node_id = %self.node_id(), task = "inbound");
        async move {
            while let Some(message) = receiver.recv().await {
                self.route_inbound(&message);
            }
            debug!("Inbound channel closed");
        }
        .instrument(span)
        .await;
    }

    /// Stop all tasks and shut the executor down
    ///
    /// Returns false when running jobs had to be aborted after the bounded wait.
    pub async fn shutdown(&self) -> bool {
        info!(node_id = %self.node_id(), "Shutting down gateway node");
        metrics().set_node_state("stopping");

        self.adapters.clear();
        self.draining.stop_all();
        let clean = self.polling.shutdown().await;

        metrics().set_node_state("stopped");
        clean
    }
}
