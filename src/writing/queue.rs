//! In-memory outbound queue
//!
//! FIFO per queue id with in-flight markers. Nothing is persisted; messages
//! queued when the process stops are lost.

use super::{OutboundQueue, QueueError, QueueMessage};
use crate::transport::Qos;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Default number of messages held per queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    in_flight: bool,
}

#[derive(Debug)]
pub struct InMemoryOutboundQueue {
    capacity: usize,
    queues: DashMap<String, Mutex<VecDeque<Entry>>>,
}

impl InMemoryOutboundQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
        }
    }

    /// Append a message, creating the queue on first use
    pub fn enqueue(
        &self,
        queue_id: &str,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: Qos,
    ) -> Result<Uuid, QueueError> {
        self.push(queue_id, QueueMessage::new(topic, payload, qos))
    }

    pub fn push(&self, queue_id: &str, message: QueueMessage) -> Result<Uuid, QueueError> {
        let queue = self.queues.entry(queue_id.to_string()).or_default();
        let mut entries = queue
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("queue {queue_id} lock poisoned")))?;

        if entries.len() >= self.capacity {
            return Err(QueueError::Full {
                queue_id: queue_id.to_string(),
                capacity: self.capacity,
            });
        }

        let id = message.id;
        entries.push_back(Entry {
            message,
            in_flight: false,
        });
        Ok(id)
    }

    /// Messages held in a queue, in flight or not
    pub fn len(&self, queue_id: &str) -> usize {
        self.queues
            .get(queue_id)
            .and_then(|queue| queue.lock().ok().map(|entries| entries.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue_id: &str) -> bool {
        self.len(queue_id) == 0
    }

    /// Messages of a queue currently marked in flight
    pub fn in_flight(&self, queue_id: &str) -> usize {
        self.queues
            .get(queue_id)
            .and_then(|queue| {
                queue
                    .lock()
                    .ok()
                    .map(|entries| entries.iter().filter(|e| e.in_flight).count())
            })
            .unwrap_or(0)
    }

    /// Ids of a queue in FIFO order
    pub fn message_ids(&self, queue_id: &str) -> Vec<Uuid> {
        self.queues
            .get(queue_id)
            .and_then(|queue| {
                queue
                    .lock()
                    .ok()
                    .map(|entries| entries.iter().map(|e| e.message.id).collect())
            })
            .unwrap_or_default()
    }

    fn with_entry<F>(&self, queue_id: &str, message_id: Uuid, update: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut VecDeque<Entry>, usize),
    {
        let queue = self
            .queues
            .get(queue_id)
            .ok_or_else(|| QueueError::UnknownQueue(queue_id.to_string()))?;
        let mut entries = queue
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("queue {queue_id} lock poisoned")))?;

        let index = entries
            .iter()
            .position(|e| e.message.id == message_id)
            .ok_or_else(|| QueueError::UnknownMessage {
                queue_id: queue_id.to_string(),
                message_id,
            })?;
        update(&mut entries, index);
        Ok(())
    }
}

impl Default for InMemoryOutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundQueue for InMemoryOutboundQueue {
    /// Returns at most one message
    ///
    /// A message larger than `max_bytes` is still returned on its own so that
    /// it cannot block the queue forever.
    async fn read_one(&self, queue_id: &str, max_bytes: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let Some(queue) = self.queues.get(queue_id) else {
            return Ok(Vec::new());
        };
        let mut entries = queue
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("queue {queue_id} lock poisoned")))?;

        match entries.iter_mut().find(|e| !e.in_flight) {
            Some(entry) => {
                if entry.message.size() > max_bytes {
                    debug!(
                        queue_id = %queue_id,
                        message_id = %entry.message.id,
                        size = entry.message.size(),
                        max_bytes,
                        "Message exceeds read budget, delivering it alone"
                    );
                }
                entry.in_flight = true;
                Ok(vec![entry.message.clone()])
            }
            None => Ok(Vec::new()),
        }
    }

    async fn ack(&self, queue_id: &str, message_id: Uuid) -> Result<(), QueueError> {
        self.with_entry(queue_id, message_id, |entries, index| {
            entries.remove(index);
        })
    }

    async fn clear_in_flight_marker(&self, queue_id: &str, message_id: Uuid) -> Result<(), QueueError> {
        self.with_entry(queue_id, message_id, |entries, index| {
            if let Some(entry) = entries.get_mut(index) {
                entry.in_flight = false;
            }
        })
    }
}
