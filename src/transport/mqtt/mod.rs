//! MQTT transport built on rumqttc (MQTT v5)
//!
//! - [`connection`] - connection state, reconnection steps and broker options
//! - [`message_handler`] - event routing and topic filter matching
//! - [`client`] - the client itself and its event loop supervisor
//!
//! ```rust,no_run
//! use edgegate::config::MqttSection;
//! use edgegate::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//! };
//!
//! let mut client = MqttClient::new("edge-01", &config)?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{
    ConnectionEvent, ConnectionState, MqttError, NodeStatus, ReconnectConfig, ReconnectStep, TopicBuilder,
};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
