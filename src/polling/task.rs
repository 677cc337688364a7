//! Self-rescheduling sampling loop of a single sampler
//!
//! A task submits one delayed job at a time. When the job completes it computes
//! the next delay from the outcome and submits the next job, so two executions
//! of the same sampler never overlap. The fault counters travel with the chain
//! of jobs instead of living in shared state.

use super::sampler::{Sampler, SamplingFailure};
use super::scheduler::{SamplerId, SamplerRegistry};
use crate::events::{Event, EventService, EventSeverity};
use crate::observability::metrics;
use crate::sampling_span;
use crate::scheduling::{
    delay_after_error, delay_after_success, run_with_watchdog, ExecutionFailure, FaultCounters,
    FaultDecision, ScheduledExecutor, SchedulingSettings,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// State carried from one cycle to the next
#[derive(Debug, Default, Clone, Copy)]
struct CycleState {
    counters: FaultCounters,
}

/// Scheduling loop for one registered sampler
pub struct SamplingTask {
    id: SamplerId,
    sampler: Arc<dyn Sampler>,
    executor: Arc<ScheduledExecutor>,
    settings: SchedulingSettings,
    events: Arc<dyn EventService>,
    /// Goes from true to false exactly once
    continue_scheduling: AtomicBool,
    registry: Weak<SamplerRegistry>,
}

impl SamplingTask {
    pub(crate) fn new(
        id: SamplerId,
        sampler: Arc<dyn Sampler>,
        executor: Arc<ScheduledExecutor>,
        settings: SchedulingSettings,
        events: Arc<dyn EventService>,
        registry: Weak<SamplerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            sampler,
            executor,
            settings,
            events,
            continue_scheduling: AtomicBool::new(true),
            registry,
        })
    }

    pub fn id(&self) -> SamplerId {
        self.id
    }

    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        &self.sampler
    }

    pub fn adapter_id(&self) -> &str {
        self.sampler.adapter_id()
    }

    /// False once the task was stopped
    pub fn is_active(&self) -> bool {
        self.continue_scheduling.load(Ordering::SeqCst)
    }

    /// Stop rescheduling; an execution already in flight runs to completion
    pub fn stop(&self) {
        if self.continue_scheduling.swap(false, Ordering::SeqCst) {
            metrics().sampler_stopped();
            debug!(
                sampler_id = %self.id,
                adapter_id = %self.sampler.adapter_id(),
                "Sampling task stopped"
            );
        }
    }

    /// Submit the first run after the sampler's initial delay
    ///
    /// Returns false when the executor rejected the job.
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        self.schedule(self.sampler.initial_delay(), CycleState::default())
    }

    fn schedule(self: &Arc<Self>, delay: Duration, state: CycleState) -> bool {
        if !self.is_active() {
            return false;
        }

        let task = Arc::clone(self);
        let span = sampling_span!(
            sampler_id = %self.id,
            adapter_id = %self.sampler.adapter_id(),
            protocol_id = %self.sampler.protocol_id()
        );
        span.follows_from(&tracing::Span::current());
        match self
            .executor
            .schedule(delay, async move { task.run(state).await }.instrument(span))
        {
            Ok(()) => true,
            Err(_) => {
                // Executor is shutting down; the task simply ends here
                debug!(sampler_id = %self.id, "Sampling job rejected by executor");
                false
            }
        }
    }

    async fn run(self: Arc<Self>, state: CycleState) {
        let start = Instant::now();
        if !self.is_active() {
            return;
        }

        let sampler = Arc::clone(&self.sampler);
        let result = run_with_watchdog(self.settings.execution_timeout, async move {
            sampler.execute().await
        })
        .await;
        let elapsed = start.elapsed();

        metrics().poll_executed(self.sampler.adapter_id(), elapsed, result.is_ok());

        match result {
            Ok(()) => self.on_success(state, elapsed),
            Err(failure) => self.on_failure(state, elapsed, failure),
        }
    }

    fn on_success(self: &Arc<Self>, mut state: CycleState, elapsed: Duration) {
        state.counters.record_success();

        let period = self.sampler.period();
        let next = delay_after_success(period, elapsed);
        if let Some(overrun) = next.overrun {
            self.report_overrun(period, overrun);
        }

        self.schedule(next.delay, state);
    }

    fn report_overrun(&self, period: Duration, overrun: Duration) {
        let adapter_id = self.sampler.adapter_id();
        warn!(
            adapter_id = %adapter_id,
            period_ms = period.as_millis() as u64,
            overrun_ms = overrun.as_millis() as u64,
            "Sampling took longer than its period, next sample starts immediately"
        );
        metrics().poll_overrun(adapter_id);

        Event::adapter(adapter_id, self.sampler.protocol_id())
            .with_severity(EventSeverity::Warn)
            .with_message(format!(
                "Adapter '{}' is not able to keep up with its polling interval of {}ms (exceeded by {}ms)",
                adapter_id,
                period.as_millis(),
                overrun.as_millis()
            ))
            .fire(self.events.as_ref());
    }

    fn on_failure(self: &Arc<Self>, mut state: CycleState, elapsed: Duration, failure: SamplingFailure) {
        let decision = if failure.is_watchdog() {
            metrics().poll_watchdog_expired(self.sampler.adapter_id());
            state
                .counters
                .record_watchdog(self.settings.watchdog_errors_before_stop)
        } else if matches!(&failure, ExecutionFailure::Failed(e) if e.is_terminal()) {
            // No retry can fix it, stop on the first occurrence
            state.counters.record_application_error(0)
        } else {
            state
                .counters
                .record_application_error(self.sampler.max_errors_before_removal())
        };

        match decision {
            FaultDecision::Stop { error_count } => {
                self.stop_after_failure(&failure, error_count);
            }
            FaultDecision::Continue { error_count } => {
                let backoff = self.settings.backoff.delay_for(error_count);
                let delay = delay_after_error(self.sampler.period(), elapsed, backoff);

                warn!(
                    adapter_id = %self.sampler.adapter_id(),
                    protocol_id = %self.sampler.protocol_id(),
                    error_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Sampling failed, retrying with backoff"
                );
                self.fire_failure_event(EventSeverity::Warn, &failure, error_count, Some(delay));
                self.notify_sampler(&failure, true);
                self.schedule(delay, state);
            }
        }
    }

    fn stop_after_failure(&self, failure: &SamplingFailure, error_count: u32) {
        error!(
            adapter_id = %self.sampler.adapter_id(),
            protocol_id = %self.sampler.protocol_id(),
            error_count,
            error = %failure,
            "Sampling failed too often, polling stopped"
        );
        self.fire_failure_event(EventSeverity::Error, failure, error_count, None);
        self.notify_sampler(failure, false);
        self.stop();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        info!(sampler_id = %self.id, "Sampler removed after repeated failures");
    }

    fn fire_failure_event(
        &self,
        severity: EventSeverity,
        failure: &SamplingFailure,
        error_count: u32,
        retry_in: Option<Duration>,
    ) {
        let adapter_id = self.sampler.adapter_id();
        let kind = if failure.is_watchdog() {
            "did not respond in time"
        } else {
            "failed"
        };
        let message = match retry_in {
            Some(delay) => format!(
                "Sampling of adapter '{adapter_id}' {kind} ({error_count} consecutive): {failure}. Retrying in {}ms",
                delay.as_millis()
            ),
            None => format!(
                "Sampling of adapter '{adapter_id}' {kind} ({error_count} consecutive): {failure}. Polling stopped"
            ),
        };

        Event::adapter(adapter_id, self.sampler.protocol_id())
            .with_severity(severity)
            .with_message(message)
            .fire(self.events.as_ref());
    }

    fn notify_sampler(&self, failure: &SamplingFailure, continuing: bool) {
        let sampler = &self.sampler;
        if catch_unwind(AssertUnwindSafe(|| sampler.on_error(failure, continuing))).is_err() {
            error!(
                adapter_id = %sampler.adapter_id(),
                "Sampler error callback panicked"
            );
        }
    }
}

impl std::fmt::Debug for SamplingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingTask")
            .field("id", &self.id)
            .field("adapter_id", &self.sampler.adapter_id())
            .field("active", &self.is_active())
            .finish()
    }
}
