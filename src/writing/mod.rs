//! Write path: draining outbound queues into devices
//!
//! Messages that arrive on a write subscription are stored in an outbound
//! queue, one queue per (adapter, tag). A [`WriteTask`] per queue reads one
//! message at a time, decodes it into the adapter's payload type, writes it and
//! then either acknowledges it or clears its in-flight marker for redelivery.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use queue::InMemoryOutboundQueue;
pub use scheduler::{queue_id_for, DrainKey, DrainTarget, QueueDrainScheduler};
pub use task::{DrainTask, WriteError, WriteTask};

use crate::transport::Qos;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// One queued outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: Bytes,
    /// Delivery QoS; above 0 the message survives retryable failures
    pub qos: Qos,
}

impl QueueMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: Qos) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Outbound queue errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Message {message_id} not found in queue {queue_id}")]
    UnknownMessage { queue_id: String, message_id: Uuid },

    #[error("Queue {queue_id} is full ({capacity} messages)")]
    Full { queue_id: String, capacity: usize },

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Read/ack/requeue contract of the outbound queue
///
/// `read_one` marks the returned messages in flight; they are not returned
/// again until acknowledged or their marker is cleared.
#[async_trait]
pub trait OutboundQueue: Send + Sync {
    /// Read the next message not in flight, bounded by `max_bytes`
    async fn read_one(&self, queue_id: &str, max_bytes: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove a message for good
    async fn ack(&self, queue_id: &str, message_id: Uuid) -> Result<(), QueueError>;

    /// Make a message available for redelivery
    async fn clear_in_flight_marker(&self, queue_id: &str, message_id: Uuid) -> Result<(), QueueError>;
}
