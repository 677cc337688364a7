//! Polling scheduler behavior tests
//!
//! Time is paused in every test, so periods, timeouts and backoff delays are
//! observed exactly instead of approximately.


use edgegate::events::{EventLog, EventSeverity};
use edgegate::pipeline::{DataPoint, PollingContext, SampleConsumer};
use edgegate::polling::{AdapterSampler, PollingScheduler};
use edgegate::scheduling::ScheduledExecutor;
use edgegate::testing::{MockOutcome, MockPollingAdapter, MockPublisher, MockSampler};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{descriptor, fast_settings};

fn scheduler(events: Arc<EventLog>) -> PollingScheduler {
    PollingScheduler::new(ScheduledExecutor::new(), fast_settings(), events)
}

#[tokio::test(start_paused = true)]
async fn test_samplers_run_independently() {
    // Arrange
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let fast = Arc::new(MockSampler::new(descriptor("sim-1", 100, -1)));
    let slow = Arc::new(MockSampler::new(descriptor("sim-2", 1000, -1)));

    // Act
    scheduler.schedule(fast.clone());
    scheduler.schedule(slow.clone());
    tokio::time::sleep(Duration::from_millis(1050)).await;

    // Assert
    assert_eq!(fast.executions(), 11);
    assert_eq!(slow.executions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_executions_of_one_sampler_never_overlap() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 100, -1))
            .with_default(MockOutcome::SucceedAfter(Duration::from_millis(250))),
    );

    scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(sampler.max_concurrent(), 1);
    let starts = sampler.start_offsets();
    for pair in starts.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_millis(250));
    }
}

#[tokio::test(start_paused = true)]
async fn test_hanging_sampler_stops_after_watchdog_threshold() {
    // Arrange: threshold 2 means the third hang stops the sampler
    let events = Arc::new(EventLog::new());
    let scheduler = scheduler(events.clone());
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 1000, -1))
            .with_default(MockOutcome::SucceedAfter(Duration::from_secs(3600))),
    );

    // Act
    let id = scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Assert
    assert_eq!(sampler.executions(), 3);
    let notifications = sampler.notifications();
    assert!(notifications.iter().all(|n| n.watchdog));
    let continuing: Vec<bool> = notifications.iter().map(|n| n.continuing).collect();
    assert_eq!(continuing, vec![true, true, false]);
    assert!(!scheduler.is_scheduled(id));

    let last = events.events().pop().unwrap();
    assert_eq!(last.severity, EventSeverity::Error);
}

#[tokio::test(start_paused = true)]
async fn test_max_errors_before_removal_two_stops_on_third_failure() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 1000, 2)).with_default(MockOutcome::Fail("device offline".into())),
    );

    scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(sampler.executions(), 3);
    let continuing: Vec<bool> = sampler.notifications().iter().map(|n| n.continuing).collect();
    assert_eq!(continuing, vec![true, true, false]);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_error_backoff_grows_up_to_cap() {
    // Period is shorter than every backoff step, so the gaps are the backoff itself
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 100, -1)).with_default(MockOutcome::Fail("device offline".into())),
    );

    scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(10)).await;

    let starts = sampler.start_offsets();
    assert!(starts.len() > 5);
    let gaps: Vec<Duration> = starts.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for pair in gaps.windows(2) {
        assert!(pair[0] <= pair[1], "backoff decreased: {gaps:?}");
    }
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(1)));
    assert!(gaps[0] >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_success_after_errors_restores_period() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 1000, -1))
            .with_script(vec![
                MockOutcome::Fail("a".into()),
                MockOutcome::Fail("b".into()),
                MockOutcome::Fail("c".into()),
            ])
            .with_default(MockOutcome::Succeed),
    );

    scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(10)).await;

    let starts = sampler.start_offsets();
    let last_gaps: Vec<Duration> = starts.windows(2).skip(3).map(|pair| pair[1] - pair[0]).collect();
    assert!(!last_gaps.is_empty());
    assert!(last_gaps.iter().all(|gap| *gap == Duration::from_millis(1000)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_for_adapter_leaves_other_adapters_running() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let stopped = Arc::new(MockSampler::new(descriptor("sim-1", 100, -1)));
    let running = Arc::new(MockSampler::new(descriptor("sim-2", 100, -1)));
    scheduler.schedule(stopped.clone());
    scheduler.schedule(running.clone());
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(scheduler.stop_for_adapter("sim-1"), 1);
    let executions = stopped.executions();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(stopped.executions(), executions);
    assert!(running.executions() > executions);
    assert_eq!(scheduler.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_execution_in_flight_prevents_next_run() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(
        MockSampler::new(descriptor("sim-1", 100, -1))
            .with_default(MockOutcome::SucceedAfter(Duration::from_millis(200))),
    );
    let id = scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The running execution completes, but is never followed by another
    assert!(scheduler.stop_polling(id));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(sampler.executions(), 1);
    assert!(!scheduler.stop_polling(id));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    let sampler = Arc::new(MockSampler::new(descriptor("sim-1", 100, -1)));
    scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(scheduler.shutdown().await);
    let executions = sampler.executions();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(sampler.executions(), executions);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_polling_context_stops_without_retry() {
    // Arrange: unlimited errors, yet a qos the broker cannot accept
    let events = Arc::new(EventLog::new());
    let scheduler = scheduler(events.clone());
    let adapter = Arc::new(MockPollingAdapter::new(vec![DataPoint::new("temperature", 21.5)]));
    let publisher = Arc::new(MockPublisher::new());
    let mut context = PollingContext::new("temperature", "plant/temperature");
    context.qos = 5;
    let sampler = Arc::new(AdapterSampler::new(
        adapter.clone(),
        context,
        SampleConsumer::new("sim-1", "simulation", publisher.clone(), events.clone()),
        descriptor("sim-1", 100, -1),
    ));

    // Act
    let id = scheduler.schedule(sampler);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert_eq!(adapter.polls(), 0);
    assert!(publisher.published().await.is_empty());
    assert!(!scheduler.is_scheduled(id));
    assert_eq!(scheduler.active_count(), 0);

    let recorded = events.events();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].severity, EventSeverity::Error);
    assert!(recorded[0].message.contains("Polling stopped"));
}

#[tokio::test(start_paused = true)]
async fn test_schedule_after_shutdown_registers_nothing() {
    let scheduler = scheduler(Arc::new(EventLog::new()));
    assert!(scheduler.shutdown().await);

    let sampler = Arc::new(MockSampler::new(descriptor("sim-1", 100, -1)));
    let id = scheduler.schedule(sampler.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(sampler.executions(), 0);
    assert_eq!(scheduler.active_count(), 0);
    assert!(!scheduler.is_scheduled(id));
}
