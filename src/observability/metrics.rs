//! Thread-safe metrics collection system
//!
//! Atomic counters cover the high-frequency node-wide numbers; per-adapter
//! statistics live in a mutex-protected map keyed by adapter id.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Maximum number of timing samples kept per adapter
const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Scheduling
    samplers_scheduled: AtomicU64,
    samplers_stopped: AtomicU64,
    drains_scheduled: AtomicU64,
    drains_stopped: AtomicU64,

    // Northbound publishing
    samples_published: AtomicU64,
    publish_failures: AtomicU64,

    // Southbound writing
    messages_written: AtomicU64,
    messages_dropped: AtomicU64,

    // MQTT
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    inbound_messages: AtomicU64,
    connection_start_time: AtomicU64,

    adapter_stats: Mutex<HashMap<String, AdapterStats>>,

    // Lifecycle
    node_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            samplers_scheduled: AtomicU64::new(0),
            samplers_stopped: AtomicU64::new(0),
            drains_scheduled: AtomicU64::new(0),
            drains_stopped: AtomicU64::new(0),
            samples_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_written: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            inbound_messages: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            adapter_stats: Mutex::new(HashMap::new()),
            node_state: Mutex::new("created".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Scheduling
    pub fn sampler_scheduled(&self) {
        self.samplers_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sampler_stopped(&self) {
        self.samplers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_scheduled(&self) {
        self.drains_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_stopped(&self) {
        self.drains_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed poll of an adapter
    pub fn poll_executed(&self, adapter_id: &str, duration: Duration, success: bool) {
        self.with_adapter(adapter_id, |stats| {
            stats.polls += 1;
            if !success {
                stats.poll_failures += 1;
            }
            stats.last_poll = current_timestamp();
            push_bounded(&mut stats.poll_times, duration.as_millis() as u64);
        });
    }

    pub fn poll_watchdog_expired(&self, adapter_id: &str) {
        self.with_adapter(adapter_id, |stats| stats.watchdog_timeouts += 1);
    }

    pub fn poll_overrun(&self, adapter_id: &str) {
        self.with_adapter(adapter_id, |stats| stats.overruns += 1);
    }

    // Northbound publishing
    pub fn sample_published(&self, adapter_id: &str) {
        self.samples_published.fetch_add(1, Ordering::Relaxed);
        self.with_adapter(adapter_id, |stats| stats.publishes += 1);
    }

    pub fn sample_publish_failed(&self, adapter_id: &str) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        self.with_adapter(adapter_id, |stats| stats.publish_failures += 1);
    }

    // Southbound writing
    pub fn message_written(&self, adapter_id: &str) {
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.with_adapter(adapter_id, |stats| stats.writes += 1);
    }

    pub fn message_write_failed(&self, adapter_id: &str) {
        self.with_adapter(adapter_id, |stats| stats.write_failures += 1);
    }

    pub fn message_dropped(&self, adapter_id: &str) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.with_adapter(adapter_id, |stats| stats.dropped += 1);
    }

    // MQTT
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.inbound_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    // Lifecycle
    pub fn set_node_state(&self, state: &str) {
        if let Ok(mut current_state) = self.node_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    fn with_adapter<F: FnOnce(&mut AdapterStats)>(&self, adapter_id: &str, update: F) {
        if let Ok(mut stats) = self.adapter_stats.lock() {
            let entry = stats
                .entry(adapter_id.to_string())
                .or_insert_with(AdapterStats::default);
            update(entry);
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.samplers_scheduled,
            &self.samplers_stopped,
            &self.drains_scheduled,
            &self.drains_stopped,
            &self.samples_published,
            &self.publish_failures,
            &self.messages_written,
            &self.messages_dropped,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.inbound_messages,
            &self.connection_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut stats) = self.adapter_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.node_state.lock() {
            *state = "created".to_string();
        }
    }

    /// Create adapter snapshot (pure function)
    fn create_adapter_snapshot(stats: &AdapterStats) -> AdapterStatsSnapshot {
        let mut sorted_times = stats.poll_times.clone();
        sorted_times.sort_unstable();

        let avg_poll_time_ms = if sorted_times.is_empty() {
            0.0
        } else {
            sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64
        };

        AdapterStatsSnapshot {
            polls: stats.polls,
            poll_failures: stats.poll_failures,
            watchdog_timeouts: stats.watchdog_timeouts,
            overruns: stats.overruns,
            publishes: stats.publishes,
            publish_failures: stats.publish_failures,
            writes: stats.writes,
            write_failures: stats.write_failures,
            dropped: stats.dropped,
            avg_poll_time_ms,
            poll_time_p95_ms: percentile(&sorted_times, 95.0),
            last_poll: stats.last_poll,
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let adapters = self
            .adapter_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(id, stats)| (id.clone(), Self::create_adapter_snapshot(stats)))
                    .collect()
            })
            .unwrap_or_default();

        let connection_duration_seconds = if self.mqtt_connected.load(Ordering::Relaxed) {
            let start_time = self.connection_start_time.load(Ordering::Relaxed);
            if start_time > 0 {
                now.saturating_sub(start_time)
            } else {
                0
            }
        } else {
            0
        };

        let current_state = self
            .node_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            scheduling: SchedulingMetrics {
                samplers_scheduled: self.samplers_scheduled.load(Ordering::Relaxed),
                samplers_stopped: self.samplers_stopped.load(Ordering::Relaxed),
                drains_scheduled: self.drains_scheduled.load(Ordering::Relaxed),
                drains_stopped: self.drains_stopped.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                samples_published: self.samples_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_written: self.messages_written.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                inbound_messages: self.inbound_messages.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            adapters,
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Internal adapter statistics (with timing data)
#[derive(Debug, Default)]
struct AdapterStats {
    polls: u64,
    poll_failures: u64,
    watchdog_timeouts: u64,
    overruns: u64,
    publishes: u64,
    publish_failures: u64,
    writes: u64,
    write_failures: u64,
    dropped: u64,
    poll_times: Vec<u64>, // milliseconds
    last_poll: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub scheduling: SchedulingMetrics,
    pub delivery: DeliveryMetrics,
    pub mqtt: MqttMetrics,
    pub adapters: HashMap<String, AdapterStatsSnapshot>,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SchedulingMetrics {
    pub samplers_scheduled: u64,
    pub samplers_stopped: u64,
    pub drains_scheduled: u64,
    pub drains_stopped: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub samples_published: u64,
    pub publish_failures: u64,
    pub messages_written: u64,
    pub messages_dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub inbound_messages: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct AdapterStatsSnapshot {
    pub polls: u64,
    pub poll_failures: u64,
    pub watchdog_timeouts: u64,
    pub overruns: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub dropped: u64,
    pub avg_poll_time_ms: f64,
    pub poll_time_p95_ms: f64,
    pub last_poll: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_TIMING_SAMPLES {
        samples.remove(0);
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
