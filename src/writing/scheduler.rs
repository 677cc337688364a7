//! Registry and lifecycle of all queue drain tasks

use super::task::{DrainTask, WriteTask};
use super::OutboundQueue;
use crate::adapters::WritingProtocolAdapter;
use crate::events::EventService;
use crate::observability::metrics;
use crate::pipeline::WriteContext;
use crate::scheduling::{ScheduledExecutor, SchedulingSettings};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Identity of one drain task: an adapter and one of its queues
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DrainKey {
    pub adapter_id: String,
    pub queue_id: String,
}

impl DrainKey {
    pub fn new(adapter_id: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            queue_id: queue_id.into(),
        }
    }
}

impl fmt::Display for DrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.adapter_id, self.queue_id)
    }
}

/// Outbound queue id of one write subscription (pure function)
pub fn queue_id_for(adapter_id: &str, tag_name: &str) -> String {
    format!("{adapter_id}/{tag_name}")
}

pub(crate) type DrainRegistry = DashMap<DrainKey, Arc<dyn DrainTask>>;

/// Lets the node schedule drains for an adapter without knowing its payload type
pub trait DrainTarget: Send + Sync {
    fn schedule_drain(self: Arc<Self>, scheduler: &QueueDrainScheduler, context: WriteContext) -> DrainKey;
}

impl<A: WritingProtocolAdapter> DrainTarget for A {
    fn schedule_drain(self: Arc<Self>, scheduler: &QueueDrainScheduler, context: WriteContext) -> DrainKey {
        scheduler.schedule(self, context)
    }
}

/// Owns one write task per (adapter, queue) pair
pub struct QueueDrainScheduler {
    executor: Arc<ScheduledExecutor>,
    settings: SchedulingSettings,
    events: Arc<dyn EventService>,
    queue: Arc<dyn OutboundQueue>,
    tasks: Arc<DrainRegistry>,
}

impl QueueDrainScheduler {
    pub fn new(
        executor: Arc<ScheduledExecutor>,
        settings: SchedulingSettings,
        events: Arc<dyn EventService>,
        queue: Arc<dyn OutboundQueue>,
    ) -> Self {
        Self {
            executor,
            settings,
            events,
            queue,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Start draining the queue of `context` into `adapter`
    ///
    /// A task already registered for the same queue is stopped and replaced.
    pub fn schedule<A: WritingProtocolAdapter>(&self, adapter: Arc<A>, context: WriteContext) -> DrainKey {
        let adapter_id = adapter.adapter_id().to_string();
        let key = DrainKey::new(&adapter_id, queue_id_for(&adapter_id, &context.tag_name));

        info!(
            adapter_id = %adapter_id,
            queue_id = %key.queue_id,
            interval_ms = context.writing_interval.as_millis() as u64,
            "Scheduling queue drain"
        );

        let task = WriteTask::new(
            key.clone(),
            adapter,
            context,
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            self.settings.clone(),
            Arc::clone(&self.events),
            Arc::downgrade(&self.tasks),
        );

        if let Some(previous) = self.tasks.insert(key.clone(), task.clone()) {
            previous.stop();
        }
        metrics().drain_scheduled();
        if !task.start() {
            warn!(queue_id = %key.queue_id, "Executor is shut down, queue drain not scheduled");
            self.tasks.remove_if(&key, |_, registered| registered.task_id() == task.task_id());
            task.stop();
        }
        key
    }

    /// Remove one drain task, then stop it
    pub fn stop_draining(&self, key: &DrainKey) -> bool {
        match self.tasks.remove(key) {
            Some((_, task)) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_for_adapter(&self, adapter_id: &str) -> usize {
        let keys: Vec<DrainKey> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().adapter_id == adapter_id)
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter(|key| self.stop_draining(key)).count()
    }

    pub fn stop_all(&self) {
        let keys: Vec<DrainKey> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for key in &keys {
            self.stop_draining(key);
        }
    }

    /// Stop everything, then shut the executor down with the configured bounded wait
    pub async fn shutdown(&self) -> bool {
        self.stop_all();
        self.executor.shutdown(self.settings.shutdown_timeout).await
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_draining(&self, key: &DrainKey) -> bool {
        self.tasks.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::testing::MockWritingAdapter;
    use crate::transport::Qos;
    use crate::writing::InMemoryOutboundQueue;
    use std::time::Duration;

    fn context(tag_name: &str) -> WriteContext {
        WriteContext {
            tag_name: tag_name.to_string(),
            topic_filter: format!("plant/{tag_name}/set"),
            qos: 1,
            writing_interval: Duration::from_millis(100),
            max_errors_before_removal: -1,
        }
    }

    fn scheduler(queue: Arc<InMemoryOutboundQueue>) -> QueueDrainScheduler {
        QueueDrainScheduler::new(
            ScheduledExecutor::new(),
            SchedulingSettings::default(),
            Arc::new(EventLog::new()),
            queue,
        )
    }

    #[test]
    fn test_queue_id_for() {
        assert_eq!(queue_id_for("press-7", "setpoint"), "press-7/setpoint");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_task() {
        let queue = Arc::new(InMemoryOutboundQueue::new());
        let scheduler = scheduler(queue.clone());
        let adapter = Arc::new(MockWritingAdapter::new());

        let first = scheduler.schedule(adapter.clone(), context("setpoint"));
        let second = scheduler.schedule(adapter.clone(), context("setpoint"));

        assert_eq!(first, second);
        assert_eq!(scheduler.active_count(), 1);

        queue.enqueue(&first.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_for_adapter() {
        let queue = Arc::new(InMemoryOutboundQueue::new());
        let scheduler = scheduler(queue.clone());
        let adapter = Arc::new(MockWritingAdapter::new());
        let other = Arc::new(MockWritingAdapter::with_id("sim-2"));

        let key = scheduler.schedule(adapter.clone(), context("a"));
        scheduler.schedule(adapter.clone(), context("b"));
        let other_key = scheduler.schedule(other.clone(), context("a"));

        assert_eq!(scheduler.stop_for_adapter("sim-1"), 2);
        assert!(!scheduler.is_draining(&key));
        assert!(scheduler.is_draining(&other_key));

        queue.enqueue(&key.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(adapter.attempts(), 0);
        assert_eq!(queue.len(&key.queue_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_target_erases_adapter_type() {
        let queue = Arc::new(InMemoryOutboundQueue::new());
        let scheduler = scheduler(queue.clone());
        let target: Arc<dyn DrainTarget> = Arc::new(MockWritingAdapter::new());

        let key = target.schedule_drain(&scheduler, context("setpoint"));

        assert_eq!(key, DrainKey::new("sim-1", "sim-1/setpoint"));
        assert!(scheduler.shutdown().await);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_shutdown_registers_nothing() {
        let queue = Arc::new(InMemoryOutboundQueue::new());
        let scheduler = scheduler(queue.clone());
        let adapter = Arc::new(MockWritingAdapter::new());
        assert!(scheduler.shutdown().await);

        let key = scheduler.schedule(adapter.clone(), context("setpoint"));
        queue.enqueue(&key.queue_id, "t", "1", Qos::AtLeastOnce).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!scheduler.is_draining(&key));
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(adapter.attempts(), 0);
    }
}
