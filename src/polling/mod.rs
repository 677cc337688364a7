//! Southbound polling engine
//!
//! Every registered [`Sampler`] gets its own [`SamplingTask`] which reschedules
//! itself after each execution on the shared executor. The
//! [`PollingScheduler`] is the registry and lifecycle entry point.

pub mod adapter_sampler;
pub mod sampler;
pub mod scheduler;
pub mod task;

pub use adapter_sampler::AdapterSampler;
pub use sampler::{Sampler, SamplerDescriptor, SamplingFailure};
pub use scheduler::{PollingScheduler, SamplerId};
pub use task::SamplingTask;
