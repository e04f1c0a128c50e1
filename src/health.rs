//! Retained lifecycle status on `system/health/{client_id}`
//!
//! Health is a transition log (ready, reconnected, shutdown, fatal error),
//! not a heartbeat. Each publication is a `system.health` envelope sent with
//! QoS 1 and retain so late subscribers learn the last known status at once.

use crate::error::BusResult;
use crate::protocol::{
    Envelope, EnvelopeCodec, EnvelopeError, HealthStatus, TopicBuilder, HEALTH_EVENT_TYPE,
};
use crate::transport::{Qos, Transport};
use std::sync::Arc;
use tracing::{debug, info};

/// Build the health envelope for `status` (pure function)
pub fn health_envelope(codec: &EnvelopeCodec, status: &HealthStatus) -> Result<Envelope, EnvelopeError> {
    codec.wrap(HEALTH_EVENT_TYPE, status, None, None)
}

/// Encoded health envelope, also used for the Last Will
pub fn encode_health(codec: &EnvelopeCodec, status: &HealthStatus) -> Result<Vec<u8>, EnvelopeError> {
    EnvelopeCodec::encode(&health_envelope(codec, status)?)
}

/// Publishes lifecycle status through any [`Transport`]
pub struct HealthReporter {
    transport: Arc<dyn Transport>,
    codec: EnvelopeCodec,
    topic: String,
}

impl HealthReporter {
    pub fn new(transport: Arc<dyn Transport>, client_id: &str, source: &str) -> Self {
        Self {
            transport,
            codec: EnvelopeCodec::new(source),
            topic: TopicBuilder::health_topic(client_id),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `{ok, event?, error?}`; fails with `NotConnected` when offline
    pub async fn publish(&self, ok: bool, event: Option<&str>, error: Option<&str>) -> BusResult<Envelope> {
        self.publish_status(&HealthStatus::new(ok, event, error)).await
    }

    pub async fn publish_status(&self, status: &HealthStatus) -> BusResult<Envelope> {
        let envelope = health_envelope(&self.codec, status)?;
        let payload = EnvelopeCodec::encode(&envelope)?;

        debug!(topic = %self.topic, ok = status.ok, event = ?status.event, "Publishing health status");
        self.transport
            .publish(&self.topic, payload, Qos::AtLeastOnce, true)
            .await?;

        if let Some(error) = &status.error {
            info!(topic = %self.topic, error = %error, "Health status reported failure");
        }
        Ok(envelope)
    }
}
