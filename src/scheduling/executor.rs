//! Shared delay-based executor
//!
//! Every sampling and drain cycle is a one-shot job submitted with a delay. The
//! executor owns the spawned jobs so that shutdown can reject new work, cancel
//! jobs that are still waiting for their delay and give running jobs a bounded
//! amount of time to finish.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Returned when a job is submitted after shutdown started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("executor is shutting down, job rejected")]
pub struct SchedulingRejected;

/// Executor shared by all polling and drain tasks of a node
pub struct ScheduledExecutor {
    runtime: Handle,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    jobs: DashMap<u64, JoinHandle<()>>,
    next_job_id: AtomicU64,
    idle: Notify,
}

impl ScheduledExecutor {
    /// Create an executor on the current tokio runtime
    ///
    /// Panics when called outside of a runtime, like `tokio::spawn`.
    pub fn new() -> Arc<Self> {
        Self::with_handle(Handle::current())
    }

    /// Create an executor that spawns onto the given runtime
    pub fn with_handle(runtime: Handle) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            runtime,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            jobs: DashMap::new(),
            next_job_id: AtomicU64::new(0),
            idle: Notify::new(),
        })
    }

    /// Submit `job` to run once after `delay`
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, job: F) -> Result<(), SchedulingRejected>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulingRejected);
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let executor: Weak<Self> = Arc::downgrade(self);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let handle = self.runtime.spawn(async move {
            // Completion must not race the registration below
            let _ = registered_rx.await;

            let fire = if *shutdown_rx.borrow() {
                false
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            };

            if fire {
                job.await;
            } else {
                debug!(job_id, "Delayed job cancelled by shutdown");
            }

            if let Some(executor) = executor.upgrade() {
                executor.finish(job_id);
            }
        });

        self.jobs.insert(job_id, handle);
        let _ = registered_tx.send(());

        Ok(())
    }

    fn finish(&self, job_id: u64) {
        self.jobs.remove(&job_id);
        if self.jobs.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Whether new jobs are still accepted
    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Jobs that are waiting for their delay or running
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Stop accepting jobs, cancel delayed ones and wait up to `timeout` for running ones.
    ///
    /// Returns `true` when everything finished in time; remaining jobs are
    /// aborted otherwise. Calling it again is harmless.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let pending = self.jobs.len();
        info!(pending_jobs = pending, "Shutting down scheduled executor");

        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            info!("Scheduled executor terminated");
            return true;
        }

        let job_ids: Vec<u64> = self.jobs.iter().map(|entry| *entry.key()).collect();
        warn!(
            remaining_jobs = job_ids.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Jobs still running after shutdown timeout, aborting"
        );
        for job_id in job_ids {
            if let Some((_, handle)) = self.jobs.remove(&job_id) {
                handle.abort();
            }
        }
        false
    }

    async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent notify is not lost
            let notified = self.idle.notified();
            if self.jobs.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ScheduledExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledExecutor")
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .field("active_jobs", &self.jobs.len())
            .finish()
    }
}
