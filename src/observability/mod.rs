//! Observability
//!
//! Structured logging, metrics collection and the health check HTTP server.

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span, sampling_span, write_span};
