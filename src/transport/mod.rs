//! Transport layer for broker communication
//!
//! The [`Transport`] trait is the seam between the broker session and the
//! components that only need to write (health reporting, heartbeat, the
//! facade's publish path). It keeps those components testable without a
//! broker; [`mqtt::ConnectionManager`] is the production implementation.

use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Delivery guarantee; QoS 2 is deliberately unrepresentable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    /// QoS 0
    #[default]
    AtMostOnce,
    /// QoS 1
    AtLeastOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = BusError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => Err(BusError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Raw message handed from the read loop to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Write-side abstraction over the broker session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes; QoS 1 waits for the broker acknowledgement
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool)
        -> BusResult<()>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if the session is ready for traffic
    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    /// Ask the session owner to tear down and re-establish the connection
    fn request_reconnect(&self, reason: &str);
}
