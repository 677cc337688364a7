//! Impure I/O operations for MQTT client
//!
//! Owns the rumqttc client and a supervisor task that drives the event loop,
//! tracks connection state, re-subscribes after reconnects and forwards
//! messages from write topics to the node.

use super::connection::{
    configure_mqtt_options, to_mqtt_qos, ConnectionEvent, ConnectionState, MqttError, NodeStatus,
    ReconnectConfig, ReconnectStep, TopicBuilder,
};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics;
use crate::transport::{
    InboundMessage, PublishError, PublishRequest, Publisher, Qos, Transport,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT client used as the gateway's northbound transport
pub struct MqttClient {
    node_id: String,
    client: AsyncClient,
    /// Shared so the client stays `Sync`; taken by the supervisor on connect
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    forwarder: Arc<MessageForwarder>,
}

impl MqttClient {
    pub fn new(node_id: &str, config: &MqttSection) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(node_id, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        Ok(Self {
            node_id: node_id.to_string(),
            client,
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            forwarder: Arc::new(MessageForwarder::new()),
        })
    }

    /// Override the reconnection timing
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Wait until the supervisor reports a ConnAck
    ///
    /// Transient disconnects are tolerated; the supervisor keeps retrying until
    /// the timeout.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let wait = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or_else(|_| {
            Err(MqttError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            ))
        })
    }

    /// Start the supervisor and wait for the first ConnAck
    ///
    /// On timeout the supervisor keeps reconnecting in the background.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| MqttError::ConnectionFailed("Event loop already started".to_string()))?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            node_id: self.node_id.clone(),
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            forwarder: Arc::clone(&self.forwarder),
        };
        metrics().mqtt_connection_attempt();
        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop)));

        let connection_timeout = self.reconnect_config.confirmation_timeout();
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
    }

    /// Announce the node offline, stop the supervisor and disconnect
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let _ = self.publish_status(false).await;

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(e.to_string()));

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT supervisor ended with error: {}", e),
                Err(_) => warn!("MQTT supervisor did not shut down in time"),
                _ => {}
            }
        }

        metrics().mqtt_connection_lost();
        info!(node_id = %self.node_id, "MQTT client disconnected");
        result
    }

    /// Get current connection state, None before `connect()`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Watch connection state changes, None before `connect()`
    pub fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state_rx.clone()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self
            .state_rx
            .as_ref()
            .ok_or_else(|| MqttError::ConnectionFailed("Client not connected".to_string()))?;

        let current_state = state_rx.borrow().clone();
        if !current_state.accepts_publishes() {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Publish retained node availability
    pub async fn publish_status(&self, online: bool) -> Result<(), MqttError> {
        self.check_connection_state()?;
        publish_node_status(&self.client, &self.node_id, online).await
    }

    /// Subscribe to a topic filter and remember it for re-subscription
    pub async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<(), MqttError> {
        let qos = to_mqtt_qos(qos);
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if !subscriptions.iter().any(|(topic, _)| topic == topic_filter) {
                subscriptions.push((topic_filter.to_string(), qos));
            }
        }

        // Not connected yet: the subscription is sent with the next ConnAck
        if self.check_connection_state().is_err() {
            debug!(topic_filter = %topic_filter, "Deferring subscription until connected");
            return Ok(());
        }

        self.client
            .subscribe(topic_filter, qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        info!(topic_filter = %topic_filter, "Subscribed to write topic");
        Ok(())
    }
}

async fn publish_node_status(client: &AsyncClient, node_id: &str, online: bool) -> Result<(), MqttError> {
    let payload = MessageHandler::format_status_payload(&NodeStatus::new(node_id, online))
        .map_err(MqttError::ConnectionFailed)?;
    client
        .publish_with_properties(
            TopicBuilder::build_status_topic(node_id),
            QoS::AtLeastOnce,
            true,
            payload,
            PublishProperties::default(),
        )
        .await
        .map_err(|e| MqttError::PublishFailed(Box::new(e)))
}

/// Background task driving the rumqttc event loop
struct Supervisor {
    node_id: String,
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    forwarder: Arc<MessageForwarder>,
}

impl Supervisor {
    async fn run(mut self, event_loop: Arc<Mutex<EventLoop>>) {
        info!(node_id = %self.node_id, "Starting MQTT supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }
                event = Self::next_event(&event_loop) => match event {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        self.process_event_route(route, &mut reconnect_attempts).await;
                    }
                    Err(e) => {
                        // rumqttc reconnects on the next poll; wait before that
                        if !self.handle_event_loop_error(e, &mut reconnect_attempts).await {
                            break;
                        }
                    }
                }
            }
        }

        info!(node_id = %self.node_id, "MQTT supervisor stopped");
    }

    async fn next_event(
        event_loop: &Mutex<EventLoop>,
    ) -> Result<rumqttc::v5::Event, rumqttc::v5::ConnectionError> {
        event_loop.lock().await.poll().await
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = ConnectionState::from(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous == next {
            return;
        }

        match &next {
            ConnectionState::Connected if matches!(previous, ConnectionState::Reconnecting(_)) => {
                info!(node_id = %self.node_id, "Reconnected to MQTT broker")
            }
            ConnectionState::Connected => info!(node_id = %self.node_id, "Connected to MQTT broker"),
            ConnectionState::Disconnected(reason) => {
                warn!(node_id = %self.node_id, reason = %reason, "Lost connection to MQTT broker")
            }
            ConnectionState::Reconnecting(attempt) => {
                info!(node_id = %self.node_id, attempt, "Reconnecting to MQTT broker")
            }
            ConnectionState::PermanentlyDisconnected(reason) => {
                error!(node_id = %self.node_id, reason = %reason, "Giving up on MQTT broker")
            }
            ConnectionState::Connecting => debug!(node_id = %self.node_id, "Connecting to MQTT broker"),
        }
    }

    async fn process_event_route(&mut self, route: EventRoute, reconnect_attempts: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAck);
                metrics().mqtt_connection_established();
                *reconnect_attempts = 0;
                self.resubscribe().await;
                if let Err(e) = publish_node_status(&self.client, &self.node_id, true).await {
                    warn!("Failed to publish node status: {}", e);
                }
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                metrics().mqtt_message_received();
                if MessageHandler::should_process_message(&topic, retain) {
                    let message = InboundMessage { topic, payload, qos };
                    if let Err(e) = self.forwarder.forward(message).await {
                        error!("Failed to forward inbound message: {}", e);
                    }
                }
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::BrokerDisconnect);
                metrics().mqtt_connection_lost();
            }
            EventRoute::SubscriptionConfirmed { packet_id, accepted } => {
                if accepted {
                    debug!(packet_id, "Subscription confirmed");
                } else {
                    warn!(packet_id, "Broker rejected subscription");
                }
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    /// Returns false when the supervisor must stop
    async fn handle_event_loop_error(
        &mut self,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
    ) -> bool {
        self.transition(ConnectionEvent::NetworkError(error.to_string()));
        metrics().mqtt_connection_failed();

        let shutdown_requested = *self.shutdown_rx.borrow();
        match self.reconnect_config.next_step(*reconnect_attempts, shutdown_requested) {
            ReconnectStep::Retry { attempt, delay } => {
                *reconnect_attempts = attempt;
                self.transition(ConnectionEvent::Retrying(attempt));
                metrics().mqtt_connection_attempt();
                self.interruptible_sleep(delay).await
            }
            ReconnectStep::Shutdown => false,
            ReconnectStep::GiveUp => {
                let reason = format!("Max reconnection attempts ({}) exceeded", *reconnect_attempts);
                self.transition(ConnectionEvent::GaveUp(reason));
                false
            }
        }
    }

    /// Returns false if shutdown was requested during the delay
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().await.clone();
        for (topic, qos) in subscriptions {
            if let Err(e) = self.client.subscribe(topic.clone(), qos).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttClient {
    /// Completes once the publish is handed to the client event loop
    async fn publish(&self, request: PublishRequest) -> Result<(), PublishError> {
        self.check_connection_state()
            .map_err(|e| PublishError::NotConnected(e.to_string()))?;

        let properties = PublishProperties {
            user_properties: request.user_properties,
            ..Default::default()
        };

        self.client
            .publish_with_properties(
                request.topic,
                to_mqtt_qos(request.qos),
                request.retain,
                request.payload,
                properties,
            )
            .await
            .map_err(|e| PublishError::Failed(e.to_string()))
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic_filter, qos).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.forwarder.set_sender(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
