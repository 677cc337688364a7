//! Mock implementations for testing
//!
//! Provides mock Sampler, Publisher, Transport and protocol adapter
//! implementations so the scheduling core can be exercised without a broker
//! or devices.

use crate::adapters::{
    AdapterError, PollingProtocolAdapter, WriteFailure, WriteInput, WritingProtocolAdapter,
};
use crate::pipeline::{DataPoint, PollingContext, Sample};
use crate::polling::{Sampler, SamplerDescriptor, SamplingFailure};
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{InboundMessage, PublishError, PublishRequest, Publisher, Qos, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

/// Scripted result of one [`MockSampler`] execution
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    /// Succeed after sleeping; longer than the execution timeout simulates a hang
    SucceedAfter(Duration),
    Fail(String),
    Panic,
}

/// One `on_error` call as seen by a [`MockSampler`]
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNotification {
    pub message: String,
    pub watchdog: bool,
    pub continuing: bool,
}

/// Sampler that follows a script and records everything the scheduler does to it
#[derive(Debug)]
pub struct MockSampler {
    descriptor: SamplerDescriptor,
    script: StdMutex<VecDeque<MockOutcome>>,
    default_outcome: MockOutcome,
    panic_on_error: bool,
    created: Instant,
    starts: StdMutex<Vec<Instant>>,
    notifications: StdMutex<Vec<ErrorNotification>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSampler {
    pub fn new(descriptor: SamplerDescriptor) -> Self {
        Self {
            descriptor,
            script: StdMutex::new(VecDeque::new()),
            default_outcome: MockOutcome::Succeed,
            panic_on_error: false,
            created: Instant::now(),
            starts: StdMutex::new(Vec::new()),
            notifications: StdMutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Outcomes used in order before falling back to the default
    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    pub fn with_default(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Make `on_error` panic after recording the notification
    pub fn with_panicking_on_error(mut self) -> Self {
        self.panic_on_error = true;
        self
    }

    pub fn executions(&self) -> usize {
        self.starts.lock().map(|starts| starts.len()).unwrap_or(0)
    }

    /// Start time of every execution relative to the creation of the mock
    pub fn start_offsets(&self) -> Vec<Duration> {
        self.starts
            .lock()
            .map(|starts| starts.iter().map(|start| *start - self.created).collect())
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<ErrorNotification> {
        self.notifications
            .lock()
            .map(|notifications| notifications.clone())
            .unwrap_or_default()
    }

    /// Highest number of overlapping executions observed
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

#[async_trait]
impl Sampler for MockSampler {
    async fn execute(&self) -> Result<(), AdapterError> {
        if let Ok(mut starts) = self.starts.lock() {
            starts.push(Instant::now());
        }
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let outcome = self.next_outcome();
        let result = match outcome {
            MockOutcome::Succeed => Ok(()),
            MockOutcome::SucceedAfter(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            MockOutcome::Fail(message) => Err(AdapterError::Communication(message)),
            MockOutcome::Panic => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("mock sampler panic");
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn descriptor(&self) -> &SamplerDescriptor {
        &self.descriptor
    }

    fn on_error(&self, failure: &SamplingFailure, continuing: bool) {
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(ErrorNotification {
                message: failure.to_string(),
                watchdog: failure.is_watchdog(),
                continuing,
            });
        }
        if self.panic_on_error {
            panic!("mock on_error panic");
        }
    }
}

/// Publisher that records every request
#[derive(Debug, Default)]
pub struct MockPublisher {
    pub published: Arc<Mutex<Vec<PublishRequest>>>,
    pub should_fail: bool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<PublishRequest> {
        self.published.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<(), PublishError> {
        if self.should_fail {
            return Err(PublishError::Failed("Mock publish failure".to_string()));
        }
        self.published.lock().await.push(request);
        Ok(())
    }
}

/// Transport that records subscriptions and can inject inbound messages
#[derive(Debug, Default)]
pub struct MockTransport {
    pub publisher: MockPublisher,
    pub subscriptions: Arc<Mutex<Vec<(String, Qos)>>>,
    pub inbound_sender: Arc<StdMutex<Option<mpsc::Sender<InboundMessage>>>>,
    pub should_fail: bool,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            publisher: MockPublisher::with_failure(),
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, Qos)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_published(&self) -> Vec<PublishRequest> {
        self.publisher.published().await
    }

    /// Deliver a message as if it arrived from the broker
    pub async fn inject(&self, topic: &str, payload: &'static [u8], qos: Qos) -> bool {
        let sender = self
            .inbound_sender
            .lock()
            .ok()
            .and_then(|sender| sender.clone());
        match sender {
            Some(sender) => sender
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: bytes::Bytes::from_static(payload),
                    qos,
                })
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Publisher for MockTransport {
    async fn publish(&self, request: PublishRequest) -> Result<(), PublishError> {
        self.publisher.publish(request).await
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MqttError::ConnectionFailed("Mock connection failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MqttError::ConnectionFailed("Mock subscribe failure".to_string()));
        }
        self.subscriptions
            .lock()
            .await
            .push((topic_filter.to_string(), qos));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.is_connected() {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected("Mock disconnection".to_string()))
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut inbound_sender) = self.inbound_sender.lock() {
            *inbound_sender = Some(sender);
        }
    }
}

/// Polling adapter returning a fixed set of data points
#[derive(Debug)]
pub struct MockPollingAdapter {
    adapter_id: String,
    points: Vec<DataPoint>,
    failures_remaining: AtomicUsize,
    polls: AtomicUsize,
}

impl MockPollingAdapter {
    pub fn new(points: Vec<DataPoint>) -> Self {
        Self {
            adapter_id: "sim-1".to_string(),
            points,
            failures_remaining: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `times` polls with a communication error
    pub fn failing_times(self, times: usize) -> Self {
        self.failures_remaining.store(times, Ordering::SeqCst);
        self
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollingProtocolAdapter for MockPollingAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn protocol_id(&self) -> &str {
        "mock"
    }

    async fn poll(&self, _context: &PollingContext) -> Result<Sample, AdapterError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AdapterError::communication("Mock device offline"));
        }
        Ok(Sample::new(self.points.clone()))
    }
}

/// Scripted result of one [`MockWritingAdapter`] write
#[derive(Debug, Clone, PartialEq)]
pub enum MockWriteOutcome {
    Succeed,
    /// Succeed once the given time has passed
    SucceedAfter(Duration),
    Fail { retryable: bool },
    /// Never completes within any reasonable execution timeout
    Hang,
}

/// Writing adapter decoding JSON values and recording successful writes
#[derive(Debug)]
pub struct MockWritingAdapter {
    adapter_id: String,
    script: StdMutex<VecDeque<MockWriteOutcome>>,
    default_outcome: MockWriteOutcome,
    attempts: AtomicUsize,
    written: StdMutex<Vec<(Uuid, Value)>>,
}

impl MockWritingAdapter {
    pub fn new() -> Self {
        Self::with_id("sim-1")
    }

    pub fn with_id(adapter_id: &str) -> Self {
        Self {
            adapter_id: adapter_id.to_string(),
            script: StdMutex::new(VecDeque::new()),
            default_outcome: MockWriteOutcome::Succeed,
            attempts: AtomicUsize::new(0),
            written: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, outcomes: Vec<MockWriteOutcome>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    pub fn with_default(mut self, outcome: MockWriteOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successfully written (message id, payload) pairs in order
    pub fn written(&self) -> Vec<(Uuid, Value)> {
        self.written
            .lock()
            .map(|written| written.clone())
            .unwrap_or_default()
    }
}

impl Default for MockWritingAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WritingProtocolAdapter for MockWritingAdapter {
    type Payload = Value;

    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn protocol_id(&self) -> &str {
        "mock"
    }

    async fn write(&self, input: WriteInput<Value>) -> Result<(), WriteFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.default_outcome.clone());

        match outcome {
            MockWriteOutcome::Succeed => {
                if let Ok(mut written) = self.written.lock() {
                    written.push((input.message_id, input.payload));
                }
                Ok(())
            }
            MockWriteOutcome::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                if let Ok(mut written) = self.written.lock() {
                    written.push((input.message_id, input.payload));
                }
                Ok(())
            }
            MockWriteOutcome::Fail { retryable } => {
                Err(WriteFailure::new("Mock write failure", retryable))
            }
            MockWriteOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(())
            }
        }
    }
}
