//! Shared scheduling machinery
//!
//! Both the polling engine and the queue drain engine are built from the same
//! parts: a shared delay-based executor, a watchdog around every execution, the
//! fault policy that turns a failed cycle into a reschedule-or-stop decision, and
//! the exponential backoff used between retries.

pub mod backoff;
pub mod executor;
pub mod policy;
pub mod watchdog;

pub use backoff::Backoff;
pub use executor::{ScheduledExecutor, SchedulingRejected};
pub use policy::{delay_after_error, delay_after_success, FaultCounters, FaultDecision, NextDelay};
pub use watchdog::{run_with_watchdog, ExecutionFailure};

use crate::config::SchedulingSection;
use std::time::Duration;

/// Runtime view of the `[scheduling]` configuration section
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingSettings {
    /// Budget for a single poll or write before it counts as hung
    pub execution_timeout: Duration,
    /// Hangs tolerated before a task is stopped permanently
    pub watchdog_errors_before_stop: u32,
    /// Retry delay generator for failed cycles
    pub backoff: Backoff,
    /// Byte budget of one outbound queue read
    pub outbound_read_batch_bytes: usize,
    /// Bounded wait for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self::from(&SchedulingSection::default())
    }
}

impl From<&SchedulingSection> for SchedulingSettings {
    fn from(section: &SchedulingSection) -> Self {
        Self {
            execution_timeout: section.execution_timeout(),
            watchdog_errors_before_stop: section.watchdog_errors_before_stop,
            backoff: Backoff::new(section.max_backoff()),
            outbound_read_batch_bytes: section.outbound_read_batch_bytes,
            shutdown_timeout: section.shutdown_timeout(),
        }
    }
}
