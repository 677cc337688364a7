//! Testing utilities and mock implementations
//!
//! Mocks for the seams of the scheduling core so that it can be tested without
//! an MQTT broker or real devices.

pub mod mocks;
pub mod spans;

pub use mocks::*;
pub use spans::SpanDepthRecorder;
