//! Bus Core - Envelope Messaging Client
//!
//! The messaging client every voice assistant service embeds to talk to the
//! MQTT broker.
//!
//! # Overview
//!
//! This crate provides:
//! - A strict JSON envelope contract (`id`, `type`, `ts`, `source`, `data`)
//! - An MQTT 5 session that reconnects with backoff and replays subscriptions
//! - Wildcard subscriptions with sequential, failure-isolated dispatch
//! - Bounded deduplication of redelivered envelopes
//! - Retained health status and an optional heartbeat watchdog
//!
//! # Quick Start
//!
//! ```rust
//! use bus_core::protocol::{EnvelopeCodec, topic_matches};
//! use serde_json::json;
//!
//! let codec = EnvelopeCodec::new("stt");
//! let envelope = codec
//!     .wrap("stt.final", &json!({"text": "turn on the lights"}), Some("turn-7"), None)
//!     .unwrap();
//!
//! let bytes = EnvelopeCodec::encode(&envelope).unwrap();
//! let decoded = EnvelopeCodec::decode(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//!
//! assert!(topic_matches("stt/+/final", "stt/en/final"));
//! assert!(topic_matches("stt/#", "stt"));
//! ```
//!
//! Connecting and dispatching goes through [`BusClient`]; see [`client`].

pub mod client;
pub mod config;
pub mod dedupe;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod observability;
pub mod protocol;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use client::{BusClient, PublishOptions};
pub use config::{ClientConfig, ConfigError, ConnectionParams};
pub use error::{BusError, BusResult};
pub use metrics::MetricsSnapshot;
pub use protocol::{events, Envelope, EnvelopeCodec, EnvelopeError, HealthStatus};
pub use subscription::{handler_fn, EnvelopeHandler, HandlerError, HandlerResult};
pub use transport::{ConnectionState, Qos};
