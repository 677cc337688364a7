//! Watchdog around a single poll or write
//!
//! The guarded future runs as its own task. When the deadline passes, the
//! caller stops waiting and gets a timeout; the work itself is left running
//! detached and its eventual result is discarded.

use std::any::Any;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why a guarded execution did not produce a value
#[derive(Debug, Clone, Error)]
pub enum ExecutionFailure<E> {
    /// Deadline passed before the execution finished
    #[error("execution did not finish within {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Execution panicked
    #[error("execution panicked: {0}")]
    Panicked(String),
    /// Execution returned an error
    #[error("{0}")]
    Failed(E),
}

impl<E> ExecutionFailure<E> {
    /// Hangs count against the watchdog threshold, everything else is an application error
    pub fn is_watchdog(&self) -> bool {
        matches!(self, ExecutionFailure::Timeout(_))
    }
}

/// Run `future` on its own task and wait at most `timeout` for it
pub async fn run_with_watchdog<T, E, F>(timeout: Duration, future: F) -> Result<T, ExecutionFailure<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let handle = tokio::spawn(future);

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(ExecutionFailure::Failed(error)),
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                Err(ExecutionFailure::Panicked(panic_message(join_error.into_panic())))
            } else {
                Err(ExecutionFailure::Panicked("execution was cancelled".to_string()))
            }
        }
        Err(_) => {
            // Dropping the JoinHandle detaches the task; it is not aborted.
            debug!(timeout_ms = timeout.as_millis() as u64, "Watchdog expired, detaching execution");
            Err(ExecutionFailure::Timeout(timeout))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
