//! Operator-visible events
//!
//! Events are the channel through which adapters falling behind, hanging or
//! being removed become visible to operators. The core only fires them; where
//! they end up is decided by the `EventService` implementation.

use crate::error::sanitize_error_message;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Operator event emitted by the scheduling core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub adapter_id: String,
    pub protocol_id: String,
    pub severity: EventSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Start building an event about an adapter
    pub fn adapter(adapter_id: impl Into<String>, protocol_id: impl Into<String>) -> EventBuilder {
        EventBuilder {
            adapter_id: adapter_id.into(),
            protocol_id: protocol_id.into(),
            severity: EventSeverity::Info,
            message: String::new(),
            payload: None,
        }
    }
}

/// Builder returned by [`Event::adapter`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    adapter_id: String,
    protocol_id: String,
    severity: EventSeverity,
    message: String,
    payload: Option<serde_json::Value>,
}

impl EventBuilder {
    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Message text; credentials are redacted and long text is truncated
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        self.message = sanitize_error_message(message.as_ref());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> Event {
        Event {
            adapter_id: self.adapter_id,
            protocol_id: self.protocol_id,
            severity: self.severity,
            message: self.message,
            payload: self.payload,
            timestamp: Utc::now(),
        }
    }

    /// Build the event and hand it to `service`
    pub fn fire(self, service: &dyn EventService) {
        service.fire(self.build());
    }
}

/// Sink for operator events
pub trait EventService: Send + Sync {
    fn fire(&self, event: Event);
}

/// Default number of events retained by [`EventLog`]
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Bounded in-memory event log that mirrors every event into the tracing output
///
/// Served by the health server under `/events` and used by tests to assert on
/// fired events.
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest-first copy of the retained events
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `limit` most recent events, newest first
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Events of one adapter, oldest first
    pub fn for_adapter(&self, adapter_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.adapter_id == adapter_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService for EventLog {
    fn fire(&self, event: Event) {
        match event.severity {
            EventSeverity::Info => info!(
                adapter_id = %event.adapter_id,
                protocol_id = %event.protocol_id,
                "Event: {}", event.message
            ),
            EventSeverity::Warn => warn!(
                adapter_id = %event.adapter_id,
                protocol_id = %event.protocol_id,
                "Event: {}", event.message
            ),
            EventSeverity::Error | EventSeverity::Critical => error!(
                adapter_id = %event.adapter_id,
                protocol_id = %event.protocol_id,
                severity = ?event.severity,
                "Event: {}", event.message
            ),
        }

        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}
