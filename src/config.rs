//! Gateway configuration
//!
//! Configuration is loaded from a TOML file. The four core scheduling knobs can
//! additionally be overridden from the environment so that operators can tune a
//! running deployment without editing the file.

use crate::pipeline::{MessageHandling, PollingContext, WriteContext};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment override for the per-job execution timeout
pub const ENV_EXECUTION_TIMEOUT_MS: &str = "EDGEGATE_EXECUTION_TIMEOUT_MS";
/// Environment override for the watchdog threshold
pub const ENV_WATCHDOG_ERRORS_BEFORE_STOP: &str = "EDGEGATE_WATCHDOG_ERRORS_BEFORE_STOP";
/// Environment override for the backoff cap
pub const ENV_MAX_BACKOFF_MS: &str = "EDGEGATE_MAX_BACKOFF_MS";
/// Environment override for the outbound read budget
pub const ENV_OUTBOUND_READ_BATCH_BYTES: &str = "EDGEGATE_OUTBOUND_READ_BATCH_BYTES";

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub node: NodeSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Node identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

/// Scheduling engine parameters shared by polling and queue draining
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingSection {
    /// How long a single poll or write may run before it counts as hung
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Number of hangs tolerated before a task is stopped for good
    #[serde(default = "default_watchdog_errors_before_stop")]
    pub watchdog_errors_before_stop: u32,
    /// Upper bound of the error backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Byte budget of a single outbound queue read
    #[serde(default = "default_outbound_read_batch_bytes")]
    pub outbound_read_batch_bytes: usize,
    /// Bounded wait for in-flight jobs during shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Size of the shared worker pool
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_execution_timeout_ms() -> u64 {
    60_000
}

fn default_watchdog_errors_before_stop() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    86_400_000 // one day
}

fn default_outbound_read_batch_bytes() -> usize {
    256 * 1024
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_worker_threads() -> usize {
    4
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout_ms(),
            watchdog_errors_before_stop: default_watchdog_errors_before_stop(),
            max_backoff_ms: default_max_backoff_ms(),
            outbound_read_batch_bytes: default_outbound_read_batch_bytes(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl SchedulingSection {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Apply `EDGEGATE_*` overrides on top of the file values
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env_override(ENV_EXECUTION_TIMEOUT_MS)? {
            self.execution_timeout_ms = value;
        }
        if let Some(value) = read_env_override(ENV_WATCHDOG_ERRORS_BEFORE_STOP)? {
            self.watchdog_errors_before_stop = value;
        }
        if let Some(value) = read_env_override(ENV_MAX_BACKOFF_MS)? {
            self.max_backoff_ms = value;
        }
        if let Some(value) = read_env_override(ENV_OUTBOUND_READ_BATCH_BYTES)? {
            self.outbound_read_batch_bytes = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduling.execution_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.outbound_read_batch_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduling.outbound_read_batch_bytes must be greater than 0".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidConfig(
                "scheduling.worker_threads must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvOverride {
                name: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Health server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

/// One protocol adapter instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Adapter instance identifier, unique per node
    pub id: String,
    /// Protocol implementation, e.g. "simulation"
    pub protocol: String,
    /// Interval between two polls of the same subscription
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Consecutive poll errors tolerated before polling stops (negative = unlimited)
    #[serde(default = "default_max_polling_errors")]
    pub max_polling_errors_before_removal: i64,
    /// Initial delay before the first poll
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub polling: Vec<PollingSubscription>,
    #[serde(default)]
    pub writing: Vec<WritingSubscription>,
    /// Protocol specific settings, interpreted by the adapter implementation
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_max_polling_errors() -> i64 {
    10
}

/// Northbound mapping: tag -> MQTT topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingSubscription {
    pub tag_name: String,
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub message_handling: MessageHandling,
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
    #[serde(default)]
    pub include_tag_names: bool,
    #[serde(default)]
    pub user_properties: Vec<UserPropertyConfig>,
}

/// Southbound mapping: MQTT topic filter -> tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WritingSubscription {
    pub tag_name: String,
    pub topic_filter: String,
    #[serde(default = "default_write_qos")]
    pub qos: u8,
    #[serde(default = "default_writing_interval_ms")]
    pub writing_interval_ms: u64,
    /// Consecutive write errors tolerated before draining stops (negative = unlimited)
    #[serde(default = "default_max_write_errors")]
    pub max_write_errors_before_removal: i64,
}

fn default_write_qos() -> u8 {
    1
}

fn default_writing_interval_ms() -> u64 {
    100
}

fn default_max_write_errors() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPropertyConfig {
    pub name: String,
    pub value: String,
}

impl AdapterConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Build the read-only polling contexts handed to the pipeline
    pub fn polling_contexts(&self) -> Vec<PollingContext> {
        self.polling
            .iter()
            .map(|subscription| PollingContext {
                tag_name: subscription.tag_name.clone(),
                topic: subscription.topic.clone(),
                qos: subscription.qos,
                message_handling: subscription.message_handling,
                include_timestamp: subscription.include_timestamp,
                include_tag_names: subscription.include_tag_names,
                user_properties: subscription
                    .user_properties
                    .iter()
                    .map(|p| (p.name.clone(), p.value.clone()))
                    .collect(),
            })
            .collect()
    }

    /// Build the read-only write contexts handed to the queue drain engine
    pub fn write_contexts(&self) -> Vec<WriteContext> {
        self.writing
            .iter()
            .map(|subscription| WriteContext {
                tag_name: subscription.tag_name.clone(),
                topic_filter: subscription.topic_filter.clone(),
                qos: subscription.qos,
                writing_interval: Duration::from_millis(subscription.writing_interval_ms),
                max_errors_before_removal: subscription.max_write_errors_before_removal,
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_identifier(&self.id) {
            return Err(ConfigError::InvalidAdapterId(format!(
                "Adapter ID '{}' must match pattern [a-zA-Z0-9._-]+",
                self.id
            )));
        }

        if self.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "adapter '{}': polling_interval_ms must be greater than 0",
                self.id
            )));
        }

        for subscription in &self.polling {
            if subscription.topic.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "adapter '{}': polling topic for tag '{}' must not be empty",
                    self.id, subscription.tag_name
                )));
            }
            validate_qos(&self.id, subscription.qos)?;
        }

        for subscription in &self.writing {
            if subscription.topic_filter.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "adapter '{}': topic filter for tag '{}' must not be empty",
                    self.id, subscription.tag_name
                )));
            }
            if subscription.writing_interval_ms == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "adapter '{}': writing_interval_ms must be greater than 0",
                    self.id
                )));
            }
            validate_qos(&self.id, subscription.qos)?;
        }

        Ok(())
    }
}

fn validate_qos(adapter_id: &str, qos: u8) -> Result<(), ConfigError> {
    if qos > 2 {
        return Err(ConfigError::InvalidConfig(format!(
            "adapter '{adapter_id}': qos {qos} is not one of 0, 1, 2"
        )));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid value '{value}' for environment override {name}")]
    InvalidEnvOverride { name: String, value: String },
    #[error("Invalid node ID format: {0}")]
    InvalidNodeId(String),
    #[error("Invalid adapter ID format: {0}")]
    InvalidAdapterId(String),
    #[error("Duplicate adapter ID: {0}")]
    DuplicateAdapterId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load configuration from TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Parse, override and validate configuration from TOML text
    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig = toml::from_str(content)?;
        config.scheduling.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_identifier(&self.node.id) {
            return Err(ConfigError::InvalidNodeId(format!(
                "Node ID '{}' must match pattern [a-zA-Z0-9._-]+",
                self.node.id
            )));
        }

        self.scheduling.validate()?;

        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            adapter.validate()?;
            if !seen.insert(adapter.id.as_str()) {
                return Err(ConfigError::DuplicateAdapterId(adapter.id.clone()));
            }
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get MQTT password, failing when the configured variable is absent
    pub fn require_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.mqtt.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Look up an adapter definition by id
    pub fn adapter(&self, adapter_id: &str) -> Option<&AdapterConfig> {
        self.adapters.iter().find(|a| a.id == adapter_id)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[node]
id = "test-node"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[adapters]]
id = "sim-1"
protocol = "simulation"
polling_interval_ms = 1000

[[adapters.polling]]
tag_name = "temperature"
topic = "plant/line1/temperature"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Check an identifier against [a-zA-Z0-9._-]+
fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[node]
id = "edge-01"

[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[scheduling]
execution_timeout_ms = 5000
watchdog_errors_before_stop = 5
max_backoff_ms = 60000
outbound_read_batch_bytes = 4096

[health]
port = 9090

[[adapters]]
id = "press-7"
protocol = "simulation"
polling_interval_ms = 250
max_polling_errors_before_removal = -1

[[adapters.polling]]
tag_name = "pressure"
topic = "plant/press-7/pressure"
qos = 1
message_handling = "per-subscription"
include_tag_names = true
user_properties = [{ name = "site", value = "berlin" }]

[[adapters.writing]]
tag_name = "setpoint"
topic_filter = "plant/press-7/setpoint/set"
qos = 2
writing_interval_ms = 50

[adapters.settings]
points_per_sample = 2
"#;

        let config = GatewayConfig::load_from_str(toml_content).unwrap();
        assert_eq!(config.node.id, "edge-01");
        assert_eq!(config.scheduling.execution_timeout_ms, 5000);
        assert_eq!(config.scheduling.watchdog_errors_before_stop, 5);
        assert_eq!(config.health.port, 9090);

        let adapter = config.adapter("press-7").unwrap();
        assert_eq!(adapter.max_polling_errors_before_removal, -1);

        let contexts = adapter.polling_contexts();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].message_handling, MessageHandling::PerSubscription);
        assert!(contexts[0].include_timestamp);
        assert!(contexts[0].include_tag_names);
        assert_eq!(
            contexts[0].user_properties,
            vec![("site".to_string(), "berlin".to_string())]
        );

        assert_eq!(adapter.settings["points_per_sample"], serde_json::json!(2));

        let writes = adapter.write_contexts();
        assert_eq!(writes[0].writing_interval, Duration::from_millis(50));
        assert_eq!(writes[0].qos, 2);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml_content = r#"
[node]
id = "minimal"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;

        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.scheduling, SchedulingSection::default());
        assert_eq!(config.scheduling.max_backoff_ms, 86_400_000);
        assert_eq!(config.scheduling.watchdog_errors_before_stop, 3);
        assert_eq!(config.health.port, 8080);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_invalid_node_id() {
        assert!(!is_valid_identifier("invalid@node"));
        assert!(!is_valid_identifier(""));
        assert!(is_valid_identifier("valid-node_1.a"));
    }

    #[test]
    fn test_duplicate_adapter_ids_rejected() {
        let mut config = GatewayConfig::test_config();
        config.adapters.push(config.adapters[0].clone());

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::DuplicateAdapterId(id)) if id == "sim-1"));
    }

    #[test]
    fn test_out_of_range_qos_rejected() {
        let mut config = GatewayConfig::test_config();
        config.adapters[0].polling[0].qos = 3;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = GatewayConfig::test_config();
        config.adapters[0].polling[0].topic = "  ".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_polling_interval_rejected() {
        let mut config = GatewayConfig::test_config();
        config.adapters[0].polling_interval_ms = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduling_durations() {
        let scheduling = SchedulingSection::default();
        assert_eq!(scheduling.execution_timeout(), Duration::from_secs(60));
        assert_eq!(scheduling.max_backoff(), Duration::from_secs(86_400));
        assert_eq!(scheduling.shutdown_timeout(), Duration::from_secs(10));
    }
}
