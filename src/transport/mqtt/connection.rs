//! Pure connection state management for the broker session
//!
//! This module contains pure functions for connection state, reconnect
//! backoff and translating a [`ClientConfig`] into rumqttc options.

use crate::config::{ClientConfig, ConnectionParams};
use crate::error::BusResult;
use crate::health;
use crate::protocol::{events, EnvelopeCodec, HealthStatus, TopicBuilder};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::time::Duration;

/// Largest packet accepted in either direction
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and none being established
    Disconnected,
    /// First handshake in progress
    Connecting,
    /// Handshake done and every tracked subscription re-issued
    Connected,
    /// Session dropped; retrying (attempt count)
    Reconnecting(u32),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Reconnection backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            min_delay: config.reconnect_min_delay(),
            max_delay: config.reconnect_max_delay(),
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based)
    ///
    /// `clamp(min * 2^attempt, min, max)`; attempts are never capped so the
    /// delay simply sustains at `max` once it gets there.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.min_delay.saturating_mul(factor);
        delay.min(self.max_delay).max(self.min_delay)
    }
}

/// Pure function to build rumqttc options from configuration
///
/// Used for the initial session and every reconnect so both paths agree.
pub fn configure_mqtt_options(
    config: &ClientConfig,
    params: &ConnectionParams,
) -> BusResult<MqttOptions> {
    let mut mqtt_options = MqttOptions::new(&config.client_id, &params.host, params.port);

    if params.is_secure() {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &params.username {
        mqtt_options.set_credentials(username, params.password().unwrap_or_default());
    }

    // Sent as u16 seconds; validation keeps it within 1..=65535
    mqtt_options.set_keep_alive(config.keepalive());
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    // Sessions are rebuilt by replaying the registry, not by broker state
    mqtt_options.set_clean_start(true);

    if config.enable_health {
        let codec = EnvelopeCodec::new(config.source_name());
        let payload = health::encode_health(&codec, &HealthStatus::event(false, events::OFFLINE))?;
        let will = LastWill::new(
            TopicBuilder::health_topic(&config.client_id),
            payload,
            QoS::AtLeastOnce,
            true,
            None,
        );
        mqtt_options.set_last_will(will);
    }

    Ok(mqtt_options)
}
