//! Pure routing of rumqttc events
//!
//! Turns every event the event loop yields into an [`EventRoute`] the
//! supervisor can act on without touching rumqttc types itself.

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAck, PubAckReason, SubAck, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Pure message routing decisions based on rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event to the appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                }),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    outcome: Self::validate_subscription(suback),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                    outcome: Self::validate_publish(puback),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                // QoS 0 publishes carry packet id 0 and are never acknowledged
                Outgoing::Publish(pkid) if *pkid != 0 => EventRoute::PublishSent(*pkid),
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent(*pkid),
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Validate SUBACK reason codes (pure function)
    pub fn validate_subscription(suback: &SubAck) -> Result<(), String> {
        let failures: Vec<String> = suback
            .return_codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .map(|code| format!("{code:?}"))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(format!("Broker rejected subscription: {}", failures.join(", ")))
        }
    }

    /// Validate a PUBACK reason (pure function)
    pub fn validate_publish(puback: &PubAck) -> Result<(), String> {
        match puback.reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
            other => Err(format!("Broker rejected publish: {other:?}")),
        }
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Handshake complete
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected(String),
    /// SUBACK for a packet id
    SubscriptionAcknowledged {
        packet_id: u16,
        outcome: Result<(), String>,
    },
    /// PUBACK for a packet id
    PublishAcknowledged {
        packet_id: u16,
        outcome: Result<(), String>,
    },
    /// A QoS 1 PUBLISH left with this packet id
    PublishSent(u16),
    /// A SUBSCRIBE left with this packet id
    SubscribeSent(u16),
    /// Our own DISCONNECT has been written
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}
