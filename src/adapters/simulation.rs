//! Simulation protocol adapter
//!
//! Produces sine waveforms instead of talking to a device, so that a node can
//! be run end-to-end without hardware. Values written to a tag replace the
//! waveform for that tag until the adapter is restarted.
//!
//! Settings (all optional):
//! - `points_per_sample`: data points per poll, default 1
//! - `min_delay_ms` / `max_delay_ms`: simulated device latency, default 0

use super::{AdapterError, PollingProtocolAdapter, WriteFailure, WriteInput, WritingProtocolAdapter};
use crate::config::AdapterConfig;
use crate::pipeline::{DataPoint, PollingContext, Sample};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

pub const PROTOCOL_ID: &str = "simulation";

/// Period of the generated waveform
const WAVE_PERIOD_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub points_per_sample: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            points_per_sample: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl SimulationSettings {
    fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let read = |name: &str| -> Result<Option<u64>, AdapterError> {
            match config.settings.get(name) {
                None => Ok(None),
                Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                    AdapterError::InvalidSettings(format!(
                        "adapter '{}': '{name}' must be a non-negative integer",
                        config.id
                    ))
                }),
            }
        };

        let points_per_sample = read("points_per_sample")?.unwrap_or(1) as usize;
        let min_delay = Duration::from_millis(read("min_delay_ms")?.unwrap_or(0));
        let max_delay = Duration::from_millis(read("max_delay_ms")?.unwrap_or(0)).max(min_delay);

        if points_per_sample == 0 {
            return Err(AdapterError::InvalidSettings(format!(
                "adapter '{}': points_per_sample must be at least 1",
                config.id
            )));
        }

        Ok(Self {
            points_per_sample,
            min_delay,
            max_delay,
        })
    }
}

pub struct SimulationAdapter {
    adapter_id: String,
    settings: SimulationSettings,
    started: Instant,
    /// Last value written per tag
    written: DashMap<String, Value>,
}

impl SimulationAdapter {
    pub fn new(adapter_id: impl Into<String>, settings: SimulationSettings) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            settings,
            started: Instant::now(),
            written: DashMap::new(),
        }
    }

    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        Ok(Self::new(&config.id, SimulationSettings::from_config(config)?))
    }

    pub fn written_value(&self, tag_name: &str) -> Option<Value> {
        self.written.get(tag_name).map(|value| value.clone())
    }

    /// Waveform value of point `index` at `elapsed` (pure function)
    pub fn waveform(elapsed: Duration, index: usize) -> f64 {
        let phase = index as f64 * std::f64::consts::FRAC_PI_4;
        let angle = elapsed.as_secs_f64() / WAVE_PERIOD_SECS * std::f64::consts::TAU + phase;
        (angle.sin() * 1000.0).round() / 1000.0
    }

    fn point_name(tag_name: &str, index: usize, count: usize) -> String {
        if count == 1 {
            tag_name.to_string()
        } else {
            format!("{tag_name}/{index}")
        }
    }

    async fn simulate_latency(&self) {
        let SimulationSettings { min_delay, max_delay, .. } = self.settings;
        if max_delay.is_zero() {
            return;
        }
        let delay = if max_delay > min_delay {
            let millis = rand::thread_rng().gen_range(min_delay.as_millis()..=max_delay.as_millis());
            Duration::from_millis(millis as u64)
        } else {
            min_delay
        };
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl PollingProtocolAdapter for SimulationAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn protocol_id(&self) -> &str {
        PROTOCOL_ID
    }

    async fn poll(&self, context: &PollingContext) -> Result<Sample, AdapterError> {
        self.simulate_latency().await;

        let count = self.settings.points_per_sample;
        let elapsed = self.started.elapsed();
        let overridden = self.written_value(&context.tag_name);

        let data_points = (0..count)
            .map(|index| {
                let value = match &overridden {
                    Some(value) => value.clone(),
                    None => Value::from(Self::waveform(elapsed, index)),
                };
                DataPoint::new(Self::point_name(&context.tag_name, index, count), value)
            })
            .collect();

        Ok(Sample::new(data_points).with_user_property("source", PROTOCOL_ID))
    }
}

#[async_trait]
impl WritingProtocolAdapter for SimulationAdapter {
    type Payload = Value;

    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn protocol_id(&self) -> &str {
        PROTOCOL_ID
    }

    async fn write(&self, input: WriteInput<Value>) -> Result<(), WriteFailure> {
        if input.payload.is_null() {
            return Err(WriteFailure::permanent(format!(
                "null is not a valid value for tag '{}'",
                input.context.tag_name
            )));
        }

        self.simulate_latency().await;
        debug!(
            adapter_id = %self.adapter_id,
            tag_name = %input.context.tag_name,
            value = %input.payload,
            "Simulated device write"
        );
        self.written.insert(input.context.tag_name, input.payload);
        Ok(())
    }
}
