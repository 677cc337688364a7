//! Fault policy for self-rescheduling tasks
//!
//! Counters and decisions are kept free of I/O so that the same policy drives
//! both sampling and queue draining, and can be tested without a runtime.

use std::time::Duration;

/// Consecutive failure counters of one task
///
/// Watchdog hangs and application errors are tracked separately; any success
/// resets both.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultCounters {
    pub watchdog_errors: u32,
    pub application_errors: u32,
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Reschedule with backoff; carries the consecutive count for that backoff
    Continue { error_count: u32 },
    /// Threshold exceeded; the task must stop permanently
    Stop { error_count: u32 },
}

impl FaultDecision {
    pub fn is_stop(&self) -> bool {
        matches!(self, FaultDecision::Stop { .. })
    }

    pub fn error_count(&self) -> u32 {
        match self {
            FaultDecision::Continue { error_count } | FaultDecision::Stop { error_count } => {
                *error_count
            }
        }
    }
}

impl FaultCounters {
    /// Reset both counters after a successful cycle
    pub fn record_success(&mut self) {
        self.watchdog_errors = 0;
        self.application_errors = 0;
    }

    /// Record a hang; stops once the count exceeds `errors_before_stop`
    pub fn record_watchdog(&mut self, errors_before_stop: u32) -> FaultDecision {
        self.watchdog_errors = self.watchdog_errors.saturating_add(1);
        let error_count = self.watchdog_errors;
        if error_count > errors_before_stop {
            FaultDecision::Stop { error_count }
        } else {
            FaultDecision::Continue { error_count }
        }
    }

    /// Record an application error (pure function of the counter and the limit)
    ///
    /// A negative limit means the task is never removed for application errors.
    pub fn record_application_error(&mut self, max_errors_before_removal: i64) -> FaultDecision {
        self.application_errors = self.application_errors.saturating_add(1);
        let error_count = self.application_errors;
        if max_errors_before_removal >= 0 && i64::from(error_count) > max_errors_before_removal {
            FaultDecision::Stop { error_count }
        } else {
            FaultDecision::Continue { error_count }
        }
    }
}

/// Delay until the next run of a fixed-period task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextDelay {
    pub delay: Duration,
    /// Set when the execution took at least the whole period
    pub overrun: Option<Duration>,
}

/// Drift-compensated delay after a successful cycle
///
/// An execution that used up the whole period is reported as an overrun by the
/// amount it exceeded the period; the next run then starts immediately.
pub fn delay_after_success(period: Duration, elapsed: Duration) -> NextDelay {
    if elapsed >= period {
        NextDelay {
            delay: Duration::ZERO,
            overrun: Some(elapsed - period),
        }
    } else {
        NextDelay {
            delay: period - elapsed,
            overrun: None,
        }
    }
}

/// Delay after a failed cycle: the remaining period or the backoff, whichever is longer
pub fn delay_after_error(period: Duration, elapsed: Duration, backoff: Duration) -> Duration {
    period.saturating_sub(elapsed).max(backoff)
}
