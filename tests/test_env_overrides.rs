//! Environment overrides of the scheduling parameters
//!
//! Kept in its own test binary with a single test, since it mutates the
//! process environment.

use edgegate::config::{
    ConfigError, GatewayConfig, ENV_EXECUTION_TIMEOUT_MS, ENV_MAX_BACKOFF_MS, ENV_OUTBOUND_READ_BATCH_BYTES,
    ENV_WATCHDOG_ERRORS_BEFORE_STOP,
};
use edgegate::scheduling::SchedulingSettings;
use std::time::Duration;

const CONFIG: &str = r#"
[node]
id = "edge-01"

[mqtt]
broker_url = "mqtt://localhost:1883"

[scheduling]
execution_timeout_ms = 5000
watchdog_errors_before_stop = 5
"#;

fn clear_overrides() {
    for name in [
        ENV_EXECUTION_TIMEOUT_MS,
        ENV_WATCHDOG_ERRORS_BEFORE_STOP,
        ENV_MAX_BACKOFF_MS,
        ENV_OUTBOUND_READ_BATCH_BYTES,
    ] {
        std::env::remove_var(name);
    }
}

#[test]
fn test_env_overrides_take_precedence_over_file() {
    // Arrange
    clear_overrides();
    let from_file = GatewayConfig::load_from_str(CONFIG).unwrap();
    assert_eq!(from_file.scheduling.execution_timeout_ms, 5000);

    std::env::set_var(ENV_EXECUTION_TIMEOUT_MS, "750");
    std::env::set_var(ENV_WATCHDOG_ERRORS_BEFORE_STOP, "1");
    std::env::set_var(ENV_MAX_BACKOFF_MS, "30000");
    std::env::set_var(ENV_OUTBOUND_READ_BATCH_BYTES, "2048");

    // Act
    let overridden = GatewayConfig::load_from_str(CONFIG).unwrap();
    let settings = SchedulingSettings::from(&overridden.scheduling);

    // Assert
    assert_eq!(settings.execution_timeout, Duration::from_millis(750));
    assert_eq!(settings.watchdog_errors_before_stop, 1);
    assert_eq!(settings.backoff.max(), Duration::from_secs(30));
    assert_eq!(settings.outbound_read_batch_bytes, 2048);

    // Unparseable values are rejected instead of silently ignored
    std::env::set_var(ENV_WATCHDOG_ERRORS_BEFORE_STOP, "three");
    let result = GatewayConfig::load_from_str(CONFIG);
    assert!(matches!(
        result,
        Err(ConfigError::InvalidEnvOverride { name, .. }) if name == ENV_WATCHDOG_ERRORS_BEFORE_STOP
    ));

    clear_overrides();
}
