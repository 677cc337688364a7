//! edgegate - scheduling and delivery core of an MQTT edge gateway
//!
//! The gateway periodically polls industrial devices through protocol adapters,
//! turns each poll result into MQTT messages, and drains queued inbound MQTT
//! messages back into devices.
//!
//! # Overview
//!
//! - A shared delay-based executor runs every poll and write job
//! - Each sampler and each drain task reschedules itself, so at most one job
//!   per task is ever in flight
//! - A watchdog bounds every execution; hangs and application errors are
//!   counted separately and stop a task once their thresholds are exceeded
//! - Failed cycles back off exponentially up to a configurable cap
//! - Poll results are wrapped into JSON envelopes and published over MQTT v5
//!
//! # Quick Start
//!
//! ```rust
//! use edgegate::testing::MockPublisher;
//! use edgegate::{EventLog, GatewayConfig, GatewayNode};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = GatewayConfig::load_from_str(r#"
//! [node]
//! id = "edge-01"
//!
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//!
//! [[adapters]]
//! id = "sim-1"
//! protocol = "simulation"
//!
//! [[adapters.polling]]
//! tag_name = "temperature"
//! topic = "plant/temperature"
//! "#).unwrap();
//!
//! let node = GatewayNode::new(config, Arc::new(MockPublisher::new()), Arc::new(EventLog::new()));
//! assert!(node.start_all().is_empty());
//! assert_eq!(node.polling().active_count(), 1);
//! node.shutdown().await;
//! # });
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod observability;
pub mod pipeline;
pub mod polling;
pub mod scheduling;
pub mod testing;
pub mod transport;
pub mod writing;

pub use adapters::{PollingProtocolAdapter, WritingProtocolAdapter};
pub use config::*;
pub use error::{GatewayError, GatewayResult};
pub use events::{Event, EventLog, EventService, EventSeverity};
pub use node::{GatewayNode, WriteSubscription};
pub use pipeline::{DataPoint, PollingContext, Sample, WriteContext};
pub use polling::{PollingScheduler, Sampler, SamplerId};
pub use writing::{DrainKey, InMemoryOutboundQueue, QueueDrainScheduler};
