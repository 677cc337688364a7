//! Error types for the gateway core
//!
//! Each subsystem owns a focused error enum; `GatewayError` aggregates them for
//! callers that drive the node as a whole (CLI, lifecycle).

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Adapter '{adapter_id}' failed: {message}")]
    AdapterFailed { adapter_id: String, message: String },

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Adapter already started: {0}")]
    AdapterAlreadyStarted(String),

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] crate::pipeline::PipelineError),

    #[error("Queue error: {0}")]
    QueueError(#[from] crate::writing::QueueError),

    #[error("MQTT error: {0}")]
    MqttError(#[from] crate::transport::mqtt::MqttError),
}

impl GatewayError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create adapter failure error
    pub fn adapter_failed<A: Into<String>, S: Into<String>>(adapter_id: A, message: S) -> Self {
        Self::AdapterFailed {
            adapter_id: adapter_id.into(),
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Maximum length of an error message attached to an operator event
const MAX_EVENT_MESSAGE_LEN: usize = 500;

/// `key=value` pairs whose value looks like a credential
static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

/// `user:password@` inside URLs
static USERINFO_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"([a-z][a-z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@").ok());

/// Sanitize error text before it leaves the process as an operator event.
///
/// Adapters frequently echo connection strings back in their errors, so
/// credential-looking pairs are redacted and the text is truncated.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(secret_pattern) = SECRET_PATTERN.as_ref() {
        sanitized = secret_pattern
            .replace_all(&sanitized, "${1}=***")
            .to_string();
    }

    if let Some(userinfo_pattern) = USERINFO_PATTERN.as_ref() {
        sanitized = userinfo_pattern
            .replace_all(&sanitized, "${1}***@")
            .to_string();
    }

    if sanitized.len() > MAX_EVENT_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_EVENT_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
