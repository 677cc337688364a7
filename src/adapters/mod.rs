//! Protocol adapter contracts
//!
//! Adapters are the device-facing side of the gateway. A polling adapter turns
//! one [`PollingContext`] into a [`Sample`]; a writing adapter receives decoded
//! payloads from the outbound queue and pushes them to the device. The node
//! only sees these traits, keyed by adapter id.

pub mod simulation;

use crate::config::AdapterConfig;
use crate::pipeline::{PipelineError, PollingContext, Sample, WriteContext};
use crate::writing::DrainTarget;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use simulation::SimulationAdapter;

/// Errors raised by adapters while polling
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("Device communication failed: {0}")]
    Communication(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid adapter settings: {0}")]
    InvalidSettings(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::Communication(message.into())
    }

    /// Errors that the same input will always reproduce; never retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pipeline(PipelineError::InvalidContext(_)))
    }
}

/// Device-facing read side of an adapter
#[async_trait]
pub trait PollingProtocolAdapter: Send + Sync + 'static {
    fn adapter_id(&self) -> &str;

    fn protocol_id(&self) -> &str;

    /// Read the tag described by `context` once
    async fn poll(&self, context: &PollingContext) -> Result<Sample, AdapterError>;
}

/// Input of a single device write
#[derive(Debug, Clone)]
pub struct WriteInput<P> {
    pub payload: P,
    pub context: WriteContext,
    /// Queue message the payload was decoded from
    pub message_id: Uuid,
    /// Topic the message arrived on
    pub topic: String,
}

/// A failed device write
///
/// `retryable` decides whether the queue entry is kept for redelivery or
/// dropped.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct WriteFailure {
    pub message: String,
    pub cause: Option<String>,
    pub retryable: bool,
}

impl WriteFailure {
    pub fn new<S: Into<String>>(message: S, retryable: bool) -> Self {
        Self {
            message: message.into(),
            cause: None,
            retryable,
        }
    }

    pub fn retryable<S: Into<String>>(message: S) -> Self {
        Self::new(message, true)
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::new(message, false)
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// Device-facing write side of an adapter
#[async_trait]
pub trait WritingProtocolAdapter: Send + Sync + 'static {
    /// Shape of the queued payloads, decoded from JSON before `write`
    type Payload: DeserializeOwned + Send + 'static;

    fn adapter_id(&self) -> &str;

    fn protocol_id(&self) -> &str;

    async fn write(&self, input: WriteInput<Self::Payload>) -> Result<(), WriteFailure>;
}

/// A created adapter instance, as far as the node is concerned
pub struct AdapterInstance {
    pub polling: Arc<dyn PollingProtocolAdapter>,
    /// Absent for read-only protocols
    pub writing: Option<Arc<dyn DrainTarget>>,
}

/// Protocols built into this binary
pub const BUILTIN_PROTOCOLS: &[&str] = &[simulation::PROTOCOL_ID];

/// Create the adapter instance for `config.protocol`
pub fn create_adapter(config: &AdapterConfig) -> Result<AdapterInstance, AdapterError> {
    match config.protocol.as_str() {
        simulation::PROTOCOL_ID => {
            let adapter = Arc::new(SimulationAdapter::from_config(config)?);
            Ok(AdapterInstance {
                polling: adapter.clone(),
                writing: Some(adapter),
            })
        }
        other => Err(AdapterError::UnsupportedProtocol(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[test]
    fn test_write_failure_constructors() {
        let failure = WriteFailure::retryable("device busy").with_cause("EAGAIN");
        assert!(failure.retryable);
        assert_eq!(failure.cause.as_deref(), Some("EAGAIN"));
        assert_eq!(failure.to_string(), "device busy");

        assert!(!WriteFailure::permanent("value out of range").retryable);
    }

    #[test]
    fn test_create_simulation_adapter() {
        let config = GatewayConfig::test_config();
        let instance = create_adapter(&config.adapters[0]).unwrap();
        assert_eq!(instance.polling.adapter_id(), "sim-1");
        assert!(instance.writing.is_some());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut config = GatewayConfig::test_config().adapters.remove(0);
        config.protocol = "opc-ua".to_string();

        let result = create_adapter(&config);
        assert!(matches!(result, Err(AdapterError::UnsupportedProtocol(p)) if p == "opc-ua"));
    }
}
