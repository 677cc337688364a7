//! Pure message routing for MQTT events
//!
//! Routing decisions, topic filter matching and inbound message construction
//! live here; forwarding into the node is the only I/O.

use super::connection::{from_mqtt_qos, NodeStatus};
use crate::transport::{InboundMessage, Qos};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: from_mqtt_qos(publish.qos),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    accepted: suback
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained messages on write topics are stale commands and are ignored (pure function)
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic = %topic, "Ignoring retained message");
            return false;
        }
        true
    }

    /// MQTT topic filter matching with `+` and `#` wildcards (pure function)
    pub fn topic_matches(filter: &str, topic: &str) -> bool {
        // Wildcards never match topics starting with '$'
        if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
            return false;
        }

        let mut filter_levels = filter.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Format node status into JSON payload (pure function)
    pub fn format_status_payload(status: &NodeStatus) -> Result<String, String> {
        serde_json::to_string(status).map_err(|e| format!("Serialization error: {e}"))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16, accepted: bool },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Forwards inbound write-topic messages to the node
#[derive(Default)]
pub struct MessageForwarder {
    sender: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut guard) = self.sender.lock() {
            *guard = Some(sender);
        }
    }

    /// Forward a message, waiting for channel capacity
    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| "Forwarder lock poisoned".to_string())?
            .clone();

        match sender {
            Some(sender) => sender
                .send(message)
                .await
                .map_err(|_| "Inbound channel closed".to_string()),
            None => Err("No inbound sender configured".to_string()),
        }
    }
}
