//! Queue drain behavior tests
//!
//! Exercises the write path end to end over the in-memory outbound queue:
//! delivery order, redelivery bookkeeping per QoS and the stop policy.


use edgegate::events::{EventLog, EventSeverity};
use edgegate::scheduling::ScheduledExecutor;
use edgegate::testing::{MockWriteOutcome, MockWritingAdapter};
use edgegate::transport::Qos;
use edgegate::writing::{InMemoryOutboundQueue, QueueDrainScheduler};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_settings, write_context};

struct Fixture {
    queue: Arc<InMemoryOutboundQueue>,
    events: Arc<EventLog>,
    scheduler: QueueDrainScheduler,
}

fn fixture() -> Fixture {
    let queue = Arc::new(InMemoryOutboundQueue::new());
    let events = Arc::new(EventLog::new());
    let scheduler = QueueDrainScheduler::new(ScheduledExecutor::new(), fast_settings(), events.clone(), queue.clone());
    Fixture {
        queue,
        events,
        scheduler,
    }
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_written_in_fifo_order() {
    // Arrange
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new());
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));
    for value in ["1", "2", "3"] {
        f.queue.enqueue(&key.queue_id, "plant/setpoint/set", value, Qos::AtLeastOnce).unwrap();
    }

    // Act
    tokio::time::sleep(Duration::from_millis(1000)).await;

    // Assert
    let written: Vec<_> = adapter.written().into_iter().map(|(_, value)| value).collect();
    assert_eq!(written, vec![json!(1), json!(2), json!(3)]);
    assert!(f.queue.is_empty(&key.queue_id));
}

#[tokio::test(start_paused = true)]
async fn test_qos0_success_removes_entry() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new());
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 0, -1));

    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "21.5", Qos::AtMostOnce).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(adapter.written().len(), 1);
    assert_eq!(f.queue.len(&key.queue_id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_redelivers_same_message() {
    let f = fixture();
    let adapter = Arc::new(
        MockWritingAdapter::new().with_script(vec![
            MockWriteOutcome::Fail { retryable: true },
            MockWriteOutcome::Fail { retryable: true },
        ]),
    );
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));
    let message_id = f
        .queue
        .enqueue(&key.queue_id, "plant/setpoint/set", "7", Qos::AtLeastOnce)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(adapter.attempts(), 3);
    assert_eq!(adapter.written(), vec![(message_id, json!(7))]);
    assert!(f.queue.is_empty(&key.queue_id));

    let warnings = f
        .events
        .events()
        .into_iter()
        .filter(|e| e.severity == EventSeverity::Warn)
        .count();
    assert_eq!(warnings, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_on_qos0_drops_message() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Fail { retryable: true }]));
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 0, -1));
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "7", Qos::AtMostOnce).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(adapter.attempts(), 1);
    assert!(adapter.written().is_empty());
    assert!(f.queue.is_empty(&key.queue_id));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_drops_message_and_continues() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new().with_script(vec![MockWriteOutcome::Fail { retryable: false }]));
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "1", Qos::AtLeastOnce).unwrap();
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "2", Qos::AtLeastOnce).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let written: Vec<_> = adapter.written().into_iter().map(|(_, value)| value).collect();
    assert_eq!(written, vec![json!(2)]);
    assert!(f.queue.is_empty(&key.queue_id));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_is_dropped() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new());
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "not json", Qos::AtLeastOnce).unwrap();
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "3", Qos::AtLeastOnce).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(adapter.attempts(), 1);
    assert_eq!(adapter.written().len(), 1);
    assert!(f.queue.is_empty(&key.queue_id));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_write_keeps_message_and_stops_after_threshold() {
    // Arrange: threshold 2 means the third hang stops draining
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new().with_default(MockWriteOutcome::Hang));
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "1", Qos::AtLeastOnce).unwrap();

    // Act
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Assert
    assert_eq!(adapter.attempts(), 3);
    assert!(!f.scheduler.is_draining(&key));
    assert_eq!(f.queue.len(&key.queue_id), 1);
    assert_eq!(f.queue.in_flight(&key.queue_id), 0);

    let last = f.events.events().pop().unwrap();
    assert_eq!(last.severity, EventSeverity::Error);
}

#[tokio::test(start_paused = true)]
async fn test_max_errors_before_removal_stops_draining() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new().with_default(MockWriteOutcome::Fail { retryable: true }));
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, 1));
    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "1", Qos::AtLeastOnce).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(adapter.attempts(), 2);
    assert_eq!(f.scheduler.active_count(), 0);
    assert_eq!(f.queue.len(&key.queue_id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_queue_is_polled_at_writing_interval() {
    let f = fixture();
    let adapter = Arc::new(MockWritingAdapter::new());
    let key = f.scheduler.schedule(adapter.clone(), write_context("setpoint", 1, -1));

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert_eq!(adapter.attempts(), 0);

    f.queue.enqueue(&key.queue_id, "plant/setpoint/set", "5", Qos::AtLeastOnce).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(adapter.attempts(), 1);
    assert!(f.events.is_empty());
}
