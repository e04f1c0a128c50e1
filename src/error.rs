//! Error types for the messaging client
//!
//! Configuration problems are fatal and surface synchronously. Transient
//! network failures are absorbed by the reconnect supervisor and never reach
//! callers; what callers do see is misuse (`NotConnected`), acknowledgement
//! timeouts, and rejected requests.

use crate::config::ConfigError;
use crate::protocol::envelope::EnvelopeError;
use crate::protocol::topics::TopicError;
use crate::transport::mqtt::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Publishing failed: {0}")]
    PublishFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("No acknowledgement for {operation} on '{topic}' within {timeout_ms}ms")]
    AckTimeout {
        operation: &'static str,
        topic: String,
        timeout_ms: u64,
    },

    #[error("Connection lost before {operation} on '{topic}' was acknowledged")]
    ConnectionLost {
        operation: &'static str,
        topic: String,
    },

    #[error("Timed out after {timeout_ms}ms waiting for the broker handshake")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Client has been shut down")]
    ShutDown,

    #[error("Unsupported QoS level {0}; only 0 and 1 are allowed")]
    InvalidQos(u8),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Create a publish failure from any transport error, scrubbing secrets
    pub fn publish_failed(err: impl std::fmt::Display) -> Self {
        Self::PublishFailed(sanitize_error_message(&err.to_string()))
    }

    /// Create a subscription failure from any transport error, scrubbing secrets
    pub fn subscription_failed(err: impl std::fmt::Display) -> Self {
        Self::SubscriptionFailed(sanitize_error_message(&err.to_string()))
    }

    /// Whether the caller may reasonably retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::NotConnected { .. }
                | BusError::AckTimeout { .. }
                | BusError::ConnectionLost { .. }
                | BusError::PublishFailed(_)
                | BusError::ConnectTimeout { .. }
        )
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

static URL_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://[^:/@\s]+):[^@\s]+@").ok());

const MAX_ERROR_LEN: usize = 500;

/// Sanitize error messages so credentials never end up in logs or errors
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = URL_CREDENTIALS.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}:***@").to_string();
    }

    if sanitized.len() > MAX_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type BusResult<T> = Result<T, BusError>;
