//! Pure connection state management for MQTT client
//!
//! Connection state, reconnection timing, broker option construction and topic
//! naming. Nothing in here performs I/O.

use crate::config::MqttSection;
use crate::transport::Qos;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum MQTT packet size accepted and produced by the gateway
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    /// Publishes and subscriptions go out only on a confirmed connection
    pub fn accepts_publishes(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Something the event loop supervisor observed about the broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnAck,
    BrokerDisconnect,
    NetworkError(String),
    Retrying(u32),
    GaveUp(String),
}

impl From<ConnectionEvent> for ConnectionState {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::ConnAck => ConnectionState::Connected,
            ConnectionEvent::BrokerDisconnect => {
                ConnectionState::Disconnected("Broker closed the connection".to_string())
            }
            ConnectionEvent::NetworkError(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::Retrying(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::GaveUp(reason) => ConnectionState::PermanentlyDisconnected(reason),
        }
    }
}

/// What the supervisor does after the event loop reported an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Wait `delay`, then poll again as reconnect `attempt`
    Retry { attempt: u32, delay: Duration },
    /// The client is being shut down
    Shutdown,
    /// Attempt limit reached
    GiveUp,
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Maximum total time of all reconnection attempts, None if unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for a 1-based attempt: the pattern, then the sustained delay
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Next step after `attempts` failed reconnects in a row
    pub fn next_step(&self, attempts: u32, shutdown_requested: bool) -> ReconnectStep {
        if shutdown_requested {
            return ReconnectStep::Shutdown;
        }
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return ReconnectStep::GiveUp;
        }

        let attempt = attempts.saturating_add(1);
        ReconnectStep::Retry {
            attempt,
            delay: Duration::from_millis(self.calculate_backoff_delay(attempt)),
        }
    }

    /// How long `connect()` waits for the first ConnAck
    ///
    /// Bounded attempts get their whole retry budget plus 30s; unlimited
    /// attempts wait one minute and keep reconnecting in the background.
    pub fn confirmation_timeout(&self) -> Duration {
        match self.calculate_max_total_time() {
            Some(total_ms) => Duration::from_millis(total_ms + 30_000),
            None => Duration::from_secs(60),
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Node availability announced on the status topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub online: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl NodeStatus {
    pub fn new(node_id: &str, online: bool) -> Self {
        Self {
            node_id: node_id.to_string(),
            online,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Build broker options from configuration (pure apart from reading credentials)
pub fn configure_mqtt_options(node_id: &str, config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per process start so a restarted node does not get kicked
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("edgegate-{node_id}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    let offline =
        serde_json::to_string(&NodeStatus::new(node_id, false)).map_err(MqttError::SerializationError)?;
    let lwt = LastWill::new(
        TopicBuilder::build_status_topic(node_id),
        offline,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

/// Map the gateway QoS onto the client library QoS (pure function)
pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Map the client library QoS onto the gateway QoS (pure function)
pub fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// Topic construction for gateway-owned topics
pub struct TopicBuilder;

impl TopicBuilder {
    /// Node availability topic: `edgegate/{node_id}/status`
    pub fn build_status_topic(node_id: &str) -> String {
        format!("edgegate/{node_id}/status")
    }
}
