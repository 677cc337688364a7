//! Transport layer between the scheduling core and the message bus
//!
//! The pipeline only needs [`Publisher`]; the node additionally drives the
//! connection and write-topic subscriptions through [`Transport`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// MQTT v5 user properties, in order
pub type UserProperties = Vec<(String, String)>;

/// Delivery guarantee of a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.as_u8()
    }
}

/// One outbound publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub qos: Qos,
    pub payload: Bytes,
    pub retain: bool,
    pub user_properties: UserProperties,
    /// Adapter the payload originates from
    pub adapter_id: String,
}

/// Publish failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Publish failed: {0}")]
    Failed(String),
}

/// Sends publish requests to the message bus
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<(), PublishError>;
}

/// Message received on one of the write-topic subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

/// Connection-oriented side of the message bus
///
/// Separated from [`Publisher`] so that the pipeline can be driven by a plain
/// publisher in tests while the node drives the full transport.
#[async_trait]
pub trait Transport: Publisher {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; subscriptions survive reconnects
    async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Set the channel that receives messages from subscribed write topics
    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(Qos::try_from(0), Ok(Qos::AtMostOnce));
        assert_eq!(Qos::try_from(1), Ok(Qos::AtLeastOnce));
        assert_eq!(Qos::try_from(2), Ok(Qos::ExactlyOnce));
        assert_eq!(Qos::try_from(3), Err(3));
        assert_eq!(u8::from(Qos::ExactlyOnce), 2);
    }

    #[test]
    fn test_qos_serde_as_number() {
        assert_eq!(serde_json::to_string(&Qos::AtLeastOnce).unwrap(), "1");
        let qos: Qos = serde_json::from_str("2").unwrap();
        assert_eq!(qos, Qos::ExactlyOnce);
        assert!(serde_json::from_str::<Qos>("7").is_err());
    }
}
