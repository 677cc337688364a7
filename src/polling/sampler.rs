//! The unit of work scheduled by the polling engine

use crate::adapters::AdapterError;
use crate::scheduling::ExecutionFailure;
use async_trait::async_trait;
use std::time::Duration;

/// Failure of one sampler execution as reported to [`Sampler::on_error`]
pub type SamplingFailure = ExecutionFailure<AdapterError>;

/// Fixed scheduling parameters of a sampler, immutable while it is registered
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    pub adapter_id: String,
    pub protocol_id: String,
    pub period: Duration,
    pub initial_delay: Duration,
    /// Consecutive application errors tolerated; negative means unlimited
    pub max_errors_before_removal: i64,
}

impl SamplerDescriptor {
    pub fn new(adapter_id: impl Into<String>, protocol_id: impl Into<String>, period: Duration) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            protocol_id: protocol_id.into(),
            period,
            initial_delay: Duration::ZERO,
            max_errors_before_removal: -1,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_errors_before_removal(mut self, max_errors: i64) -> Self {
        self.max_errors_before_removal = max_errors;
        self
    }
}

/// One schedulable sampling job
#[async_trait]
pub trait Sampler: Send + Sync + 'static {
    /// Perform one sample; runs under the watchdog
    async fn execute(&self) -> Result<(), AdapterError>;

    fn descriptor(&self) -> &SamplerDescriptor;

    /// Called after every failed execution
    ///
    /// `continuing` is false when this failure stopped the sampler for good.
    /// Must not block; a panic in here is caught and logged.
    fn on_error(&self, _failure: &SamplingFailure, _continuing: bool) {}

    fn adapter_id(&self) -> &str {
        &self.descriptor().adapter_id
    }

    fn protocol_id(&self) -> &str {
        &self.descriptor().protocol_id
    }

    fn period(&self) -> Duration {
        self.descriptor().period
    }

    fn initial_delay(&self) -> Duration {
        self.descriptor().initial_delay
    }

    fn max_errors_before_removal(&self) -> i64 {
        self.descriptor().max_errors_before_removal
    }
}
