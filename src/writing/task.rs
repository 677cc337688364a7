//! Self-rescheduling drain loop of a single outbound queue
//!
//! Same timing discipline as sampling: one job in flight, drift-compensated
//! period on success, backoff on failure, permanent stop once the error
//! threshold is exceeded. Each cycle handles at most one queued message.

use super::scheduler::{DrainKey, DrainRegistry};
use super::{OutboundQueue, QueueError, QueueMessage};
use crate::adapters::{WriteFailure, WriteInput, WritingProtocolAdapter};
use crate::events::{Event, EventService, EventSeverity};
use crate::observability::metrics;
use crate::pipeline::WriteContext;
use crate::scheduling::{
    delay_after_error, delay_after_success, run_with_watchdog, ExecutionFailure, FaultCounters,
    FaultDecision, ScheduledExecutor, SchedulingSettings,
};
use crate::transport::Qos;
use crate::write_span;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Application level failure of one drain cycle
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Payload of message {message_id} could not be decoded: {reason}")]
    Decode { message_id: Uuid, reason: String },

    #[error("Device write failed: {0}")]
    Write(#[from] WriteFailure),
}

type CycleFailure = ExecutionFailure<WriteError>;

/// Type-erased handle the drain registry keeps for each task
pub trait DrainTask: Send + Sync {
    fn key(&self) -> &DrainKey;

    /// Distinguishes a task from a later task registered under the same key
    fn task_id(&self) -> Uuid;

    fn is_active(&self) -> bool;

    fn stop(&self);
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleState {
    counters: FaultCounters,
}

/// Drains one queue into one writing adapter
pub struct WriteTask<A: WritingProtocolAdapter> {
    key: DrainKey,
    task_id: Uuid,
    adapter: Arc<A>,
    context: WriteContext,
    queue: Arc<dyn OutboundQueue>,
    executor: Arc<ScheduledExecutor>,
    settings: SchedulingSettings,
    events: Arc<dyn EventService>,
    continue_scheduling: AtomicBool,
    registry: Weak<DrainRegistry>,
}

impl<A: WritingProtocolAdapter> WriteTask<A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: DrainKey,
        adapter: Arc<A>,
        context: WriteContext,
        queue: Arc<dyn OutboundQueue>,
        executor: Arc<ScheduledExecutor>,
        settings: SchedulingSettings,
        events: Arc<dyn EventService>,
        registry: Weak<DrainRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            task_id: Uuid::new_v4(),
            adapter,
            context,
            queue,
            executor,
            settings,
            events,
            continue_scheduling: AtomicBool::new(true),
            registry,
        })
    }

    pub fn context(&self) -> &WriteContext {
        &self.context
    }

    /// First drain runs immediately; false when the executor rejected it
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        self.schedule(Duration::ZERO, CycleState::default())
    }

    fn schedule(self: &Arc<Self>, delay: Duration, state: CycleState) -> bool {
        if !self.is_active() {
            return false;
        }

        let task = Arc::clone(self);
        let span = write_span!(
            adapter_id = %self.key.adapter_id,
            queue_id = %self.key.queue_id
        );
        span.follows_from(&tracing::Span::current());
        let submitted = self
            .executor
            .schedule(delay, async move { task.run(state).await }.instrument(span))
            .is_ok();
        if !submitted {
            debug!(queue_id = %self.key.queue_id, "Drain job rejected by executor");
        }
        submitted
    }

    async fn run(self: Arc<Self>, state: CycleState) {
        let start = Instant::now();
        if !self.is_active() {
            return;
        }

        let result = self.drain_one().await;
        let elapsed = start.elapsed();

        match result {
            Ok(()) => self.on_success(state, elapsed),
            Err(failure) => self.on_failure(state, elapsed, failure),
        }
    }

    /// Read, decode, write and reconcile one message; an empty queue is a success
    async fn drain_one(&self) -> Result<(), CycleFailure> {
        let messages = self
            .queue
            .read_one(&self.key.queue_id, self.settings.outbound_read_batch_bytes)
            .await
            .map_err(|e| ExecutionFailure::Failed(WriteError::Queue(e)))?;

        let mut messages = messages.into_iter();
        let Some(message) = messages.next() else {
            return Ok(());
        };
        for extra in messages {
            self.clear_marker(extra.id).await;
        }

        let payload: A::Payload = match serde_json::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Undecodable messages never become decodable; drop them
                self.ack(message.id).await;
                metrics().message_dropped(&self.key.adapter_id);
                return Err(ExecutionFailure::Failed(WriteError::Decode {
                    message_id: message.id,
                    reason: e.to_string(),
                }));
            }
        };

        let input = WriteInput {
            payload,
            context: self.context.clone(),
            message_id: message.id,
            topic: message.topic.clone(),
        };
        let adapter = Arc::clone(&self.adapter);
        let outcome = run_with_watchdog(self.settings.execution_timeout, async move {
            adapter.write(input).await
        })
        .await;

        self.reconcile(&message, outcome).await
    }

    async fn reconcile(
        &self,
        message: &QueueMessage,
        outcome: Result<(), ExecutionFailure<WriteFailure>>,
    ) -> Result<(), CycleFailure> {
        let keep_for_redelivery = message.qos != Qos::AtMostOnce;

        match outcome {
            Ok(()) => {
                self.ack(message.id).await;
                metrics().message_written(&self.key.adapter_id);
                debug!(message_id = %message.id, "Message written");
                Ok(())
            }
            Err(ExecutionFailure::Failed(failure)) => {
                metrics().message_write_failed(&self.key.adapter_id);
                if failure.retryable && keep_for_redelivery {
                    self.clear_marker(message.id).await;
                } else {
                    self.ack(message.id).await;
                    metrics().message_dropped(&self.key.adapter_id);
                }
                Err(ExecutionFailure::Failed(WriteError::Write(failure)))
            }
            Err(ExecutionFailure::Panicked(reason)) => {
                metrics().message_write_failed(&self.key.adapter_id);
                self.ack(message.id).await;
                metrics().message_dropped(&self.key.adapter_id);
                Err(ExecutionFailure::Panicked(reason))
            }
            Err(ExecutionFailure::Timeout(timeout)) => {
                metrics().message_write_failed(&self.key.adapter_id);
                if keep_for_redelivery {
                    self.clear_marker(message.id).await;
                } else {
                    self.ack(message.id).await;
                    metrics().message_dropped(&self.key.adapter_id);
                }
                Err(ExecutionFailure::Timeout(timeout))
            }
        }
    }

    async fn ack(&self, message_id: Uuid) {
        if let Err(e) = self.queue.ack(&self.key.queue_id, message_id).await {
            warn!(queue_id = %self.key.queue_id, message_id = %message_id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn clear_marker(&self, message_id: Uuid) {
        if let Err(e) = self
            .queue
            .clear_in_flight_marker(&self.key.queue_id, message_id)
            .await
        {
            warn!(queue_id = %self.key.queue_id, message_id = %message_id, error = %e, "Failed to clear in-flight marker");
        }
    }

    fn on_success(self: &Arc<Self>, mut state: CycleState, elapsed: Duration) {
        state.counters.record_success();

        let interval = self.context.writing_interval;
        let next = delay_after_success(interval, elapsed);
        if let Some(overrun) = next.overrun {
            warn!(
                adapter_id = %self.key.adapter_id,
                queue_id = %self.key.queue_id,
                interval_ms = interval.as_millis() as u64,
                overrun_ms = overrun.as_millis() as u64,
                "Write took longer than the writing interval"
            );
            Event::adapter(&self.key.adapter_id, self.adapter.protocol_id())
                .with_severity(EventSeverity::Warn)
                .with_message(format!(
                    "Adapter '{}' is not able to keep up with its writing interval of {}ms for tag '{}'",
                    self.key.adapter_id,
                    interval.as_millis(),
                    self.context.tag_name
                ))
                .fire(self.events.as_ref());
        }

        self.schedule(next.delay, state);
    }

    fn on_failure(self: &Arc<Self>, mut state: CycleState, elapsed: Duration, failure: CycleFailure) {
        let decision = if failure.is_watchdog() {
            state
                .counters
                .record_watchdog(self.settings.watchdog_errors_before_stop)
        } else {
            state
                .counters
                .record_application_error(self.context.max_errors_before_removal)
        };

        let adapter_id = &self.key.adapter_id;
        match decision {
            FaultDecision::Stop { error_count } => {
                error!(
                    adapter_id = %adapter_id,
                    queue_id = %self.key.queue_id,
                    error_count,
                    error = %failure,
                    "Writing failed too often, draining stopped"
                );
                Event::adapter(adapter_id, self.adapter.protocol_id())
                    .with_severity(EventSeverity::Error)
                    .with_message(format!(
                        "Writing to tag '{}' of adapter '{adapter_id}' failed {error_count} times in a row: {failure}. Writing stopped",
                        self.context.tag_name
                    ))
                    .fire(self.events.as_ref());
                self.stop();
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove_if(&self.key, |_, task| task.task_id() == self.task_id);
                }
                info!(queue_id = %self.key.queue_id, "Drain task removed after repeated failures");
            }
            FaultDecision::Continue { error_count } => {
                let backoff = self.settings.backoff.delay_for(error_count);
                let delay = delay_after_error(self.context.writing_interval, elapsed, backoff);
                warn!(
                    adapter_id = %adapter_id,
                    queue_id = %self.key.queue_id,
                    error_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Write cycle failed, retrying with backoff"
                );
                Event::adapter(adapter_id, self.adapter.protocol_id())
                    .with_severity(EventSeverity::Warn)
                    .with_message(format!(
                        "Writing to tag '{}' of adapter '{adapter_id}' failed ({error_count} consecutive): {failure}. Retrying in {}ms",
                        self.context.tag_name,
                        delay.as_millis()
                    ))
                    .fire(self.events.as_ref());
                self.schedule(delay, state);
            }
        }
    }
}

impl<A: WritingProtocolAdapter> DrainTask for WriteTask<A> {
    fn key(&self) -> &DrainKey {
        &self.key
    }

    fn task_id(&self) -> Uuid {
        self.task_id
    }

    fn is_active(&self) -> bool {
        self.continue_scheduling.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.continue_scheduling.swap(false, Ordering::SeqCst) {
            metrics().drain_stopped();
            debug!(queue_id = %self.key.queue_id, "Drain task stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::testing::{MockWriteOutcome, MockWritingAdapter};
    use crate::writing::{queue_id_for, InMemoryOutboundQueue};
    use dashmap::DashMap;

    struct Harness {
        queue: Arc<InMemoryOutboundQueue>,
        adapter: Arc<MockWritingAdapter>,
        events: Arc<EventLog>,
        task: Arc<WriteTask<MockWritingAdapter>>,
        queue_id: String,
        _registry: Arc<DrainRegistry>,
    }

    fn harness(adapter: MockWritingAdapter, max_errors: i64) -> Harness {
        let queue = Arc::new(InMemoryOutboundQueue::new());
        let adapter = Arc::new(adapter);
        let events = Arc::new(EventLog::new());
        let registry: Arc<DrainRegistry> = Arc::new(DashMap::new());
        let context = WriteContext {
            tag_name: "setpoint".to_string(),
            topic_filter: "plant/setpoint/set".to_string(),
            qos: 1,
            writing_interval: Duration::from_millis(100),
            max_errors_before_removal: max_errors,
        };
        let queue_id = queue_id_for("sim-1", "setpoint");
        let settings = SchedulingSettings {
            execution_timeout: Duration::from_millis(500),
            ..SchedulingSettings::default()
        };
        let task = WriteTask::new(
            DrainKey::new("sim-1", queue_id.clone()),
            Arc::clone(&adapter),
            context,
            queue.clone(),
            ScheduledExecutor::new(),
            settings,
            events.clone(),
            Arc::downgrade(&registry),
        );
        registry.insert(task.key().clone(), task.clone());
        Harness {
            queue,
            adapter,
            events,
            task,
            queue_id,
            _registry: registry,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_write_acknowledges() {
        let h = harness(MockWritingAdapter::new(), -1);
        h.queue.enqueue(&h.queue_id, "plant/setpoint/set", "42", Qos::AtLeastOnce).unwrap();
        h.queue.enqueue(&h.queue_id, "plant/setpoint/set", "43", Qos::AtMostOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(h.queue.is_empty(&h.queue_id));
        let written: Vec<serde_json::Value> = h.adapter.written().into_iter().map(|(_, p)| p).collect();
        assert_eq!(written, vec![serde_json::json!(42), serde_json::json!(43)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_keeps_message() {
        let h = harness(
            MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Fail { retryable: true }]),
            -1,
        );
        let id = h.queue.enqueue(&h.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.queue.message_ids(&h.queue_id), vec![id]);
        assert_eq!(h.queue.in_flight(&h.queue_id), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.queue.is_empty(&h.queue_id));
        assert_eq!(h.adapter.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_on_qos0_drops_message() {
        let h = harness(
            MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Fail { retryable: true }]),
            -1,
        );
        h.queue.enqueue(&h.queue_id, "t", "1", Qos::AtMostOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.queue.is_empty(&h.queue_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_drops_message() {
        let h = harness(
            MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Fail { retryable: false }]),
            -1,
        );
        h.queue.enqueue(&h.queue_id, "t", "1", Qos::ExactlyOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.queue.is_empty(&h.queue_id));
        assert_eq!(h.events.events()[0].severity, EventSeverity::Warn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_is_dropped() {
        let h = harness(MockWritingAdapter::new(), -1);
        h.queue.enqueue(&h.queue_id, "t", "not json", Qos::AtLeastOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.queue.is_empty(&h.queue_id));
        assert_eq!(h.adapter.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_write_keeps_qos1_message() {
        let h = harness(
            MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Hang]),
            -1,
        );
        let id = h.queue.enqueue(&h.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(h.queue.message_ids(&h.queue_id), vec![id]);
        assert_eq!(h.queue.in_flight(&h.queue_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_threshold() {
        let h = harness(
            MockWritingAdapter::new().with_default(MockWriteOutcome::Fail { retryable: true }),
            1,
        );
        for value in 0..5 {
            h.queue
                .enqueue(&h.queue_id, "t", value.to_string(), Qos::AtLeastOnce)
                .unwrap();
        }

        h.task.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.adapter.attempts(), 2);
        assert!(!h.task.is_active());
        assert!(h._registry.is_empty());
        assert_eq!(h.events.events().last().unwrap().severity, EventSeverity::Error);
        assert_eq!(h.queue.len(&h.queue_id), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_keeps_polling_at_interval() {
        let h = harness(MockWritingAdapter::new(), -1);

        h.task.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.queue.enqueue(&h.queue_id, "t", "7", Qos::AtLeastOnce).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.adapter.attempts(), 1);
        assert!(h.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_warns_about_writing_interval() {
        let h = harness(
            MockWritingAdapter::new().with_script(vec![
                MockWriteOutcome::SucceedAfter(Duration::from_millis(250)),
                MockWriteOutcome::Succeed,
                MockWriteOutcome::SucceedAfter(Duration::from_millis(180)),
            ]),
            -1,
        );
        for value in 0..3 {
            h.queue
                .enqueue(&h.queue_id, "t", value.to_string(), Qos::AtLeastOnce)
                .unwrap();
        }

        h.task.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // One warning for the first overrun, next write started right away
        let warnings: Vec<_> = h
            .events
            .events()
            .into_iter()
            .filter(|e| e.severity == EventSeverity::Warn)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("writing interval of 100ms"));
        assert_eq!(h.adapter.written().len(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;

        let warnings = h
            .events
            .events()
            .into_iter()
            .filter(|e| e.severity == EventSeverity::Warn && e.message.contains("writing interval"))
            .count();
        assert_eq!(warnings, 2);
        assert!(h.queue.is_empty(&h.queue_id));
        assert!(h.task.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_cycle_spans_stay_flat() {
        let recorder = crate::testing::SpanDepthRecorder::new("write_cycle");
        let _guard = recorder.install();
        let h = harness(MockWritingAdapter::new(), -1);
        h.queue.enqueue(&h.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();

        h.task.start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(recorder.created() >= 50);
        assert_eq!(recorder.max_depth(), 1);
    }
}
