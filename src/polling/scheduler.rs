//! Registry and lifecycle of all active samplers

use super::sampler::Sampler;
use super::task::SamplingTask;
use crate::events::EventService;
use crate::observability::metrics;
use crate::scheduling::{ScheduledExecutor, SchedulingSettings};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity of one sampler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SamplerId(Uuid);

impl SamplerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SamplerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SamplerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) type SamplerRegistry = DashMap<SamplerId, Arc<SamplingTask>>;

/// Schedules samplers on the shared executor and tracks them until they stop
pub struct PollingScheduler {
    executor: Arc<ScheduledExecutor>,
    settings: SchedulingSettings,
    events: Arc<dyn EventService>,
    tasks: Arc<SamplerRegistry>,
}

impl PollingScheduler {
    pub fn new(
        executor: Arc<ScheduledExecutor>,
        settings: SchedulingSettings,
        events: Arc<dyn EventService>,
    ) -> Self {
        Self {
            executor,
            settings,
            events,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Register `sampler` and submit its first run after the initial delay
    pub fn schedule(&self, sampler: Arc<dyn Sampler>) -> SamplerId {
        let id = SamplerId::new();
        let task = SamplingTask::new(
            id,
            sampler,
            Arc::clone(&self.executor),
            self.settings.clone(),
            Arc::clone(&self.events),
            Arc::downgrade(&self.tasks),
        );

        info!(
            sampler_id = %id,
            adapter_id = %task.adapter_id(),
            period_ms = task.sampler().period().as_millis() as u64,
            initial_delay_ms = task.sampler().initial_delay().as_millis() as u64,
            "Scheduling sampler"
        );

        self.tasks.insert(id, Arc::clone(&task));
        metrics().sampler_scheduled();
        if !task.start() {
            warn!(sampler_id = %id, "Executor is shut down, sampler not scheduled");
            self.stop_polling(id);
        }
        id
    }

    /// Remove one sampler, then stop it; false if it was not registered
    pub fn stop_polling(&self, id: SamplerId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, task)) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every sampler of one adapter and return how many were stopped
    pub fn stop_for_adapter(&self, adapter_id: &str) -> usize {
        // Ids are collected first; removing while iterating would deadlock the shard
        let ids: Vec<SamplerId> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().adapter_id() == adapter_id)
            .map(|entry| *entry.key())
            .collect();

        let stopped = ids.into_iter().filter(|id| self.stop_polling(*id)).count();
        if stopped > 0 {
            info!(adapter_id = %adapter_id, stopped, "Stopped polling for adapter");
        }
        stopped
    }

    /// Stop and remove every sampler
    pub fn stop_all(&self) {
        let ids: Vec<SamplerId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.stop_polling(id);
        }
    }

    /// Stop everything, then shut the executor down with the configured bounded wait
    ///
    /// Returns false when running jobs had to be aborted.
    pub async fn shutdown(&self) -> bool {
        self.stop_all();
        self.executor.shutdown(self.settings.shutdown_timeout).await
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_scheduled(&self, id: SamplerId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Ids of the samplers registered for one adapter
    pub fn sampler_ids_for(&self, adapter_id: &str) -> Vec<SamplerId> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().adapter_id() == adapter_id)
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::polling::SamplerDescriptor;
    use crate::testing::MockSampler;
    use std::time::Duration;

    fn scheduler() -> PollingScheduler {
        PollingScheduler::new(
            ScheduledExecutor::new(),
            SchedulingSettings::default(),
            Arc::new(EventLog::new()),
        )
    }

    fn sampler(adapter_id: &str) -> Arc<MockSampler> {
        Arc::new(MockSampler::new(SamplerDescriptor::new(
            adapter_id,
            "simulation",
            Duration::from_millis(100),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_and_stop_polling() {
        let scheduler = scheduler();
        let id = scheduler.schedule(sampler("a"));
        assert!(scheduler.is_scheduled(id));
        assert_eq!(scheduler.active_count(), 1);

        assert!(scheduler.stop_polling(id));
        assert!(!scheduler.stop_polling(id));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_for_adapter_only_touches_that_adapter() {
        let scheduler = scheduler();
        let first = sampler("a");
        let other = sampler("b");
        scheduler.schedule(first.clone());
        scheduler.schedule(sampler("a"));
        scheduler.schedule(other.clone());

        assert_eq!(scheduler.stop_for_adapter("a"), 2);
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.sampler_ids_for("b").len(), 1);

        let executions = first.executions();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(first.executions(), executions);
        assert!(other.executions() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let scheduler = scheduler();
        let sampler = sampler("a");
        scheduler.schedule(sampler.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(scheduler.shutdown().await);
        assert_eq!(scheduler.active_count(), 0);

        let executions = sampler.executions();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sampler.executions(), executions);

        // The executor rejects new work once shut down
        let id = scheduler.schedule(sampler.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sampler.executions(), executions);
        assert_eq!(scheduler.active_count(), 0);
        assert!(!scheduler.is_scheduled(id));
    }
}
