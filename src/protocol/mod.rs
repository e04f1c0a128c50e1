//! Wire-level contract shared by every service
//!
//! - [`envelope`] - the self-describing envelope and its strict JSON codec
//! - [`messages`] - health and heartbeat payloads
//! - [`topics`] - topic validation, wildcard matching and system topics

pub mod envelope;
pub mod messages;
pub mod topics;

pub use envelope::{Envelope, EnvelopeCodec, EnvelopeError};
pub use messages::{events, HealthStatus, HeartbeatPayload, HEALTH_EVENT_TYPE};
pub use topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicBuilder, TopicError};
