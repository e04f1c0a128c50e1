//! MQTT 5 broker session built on rumqttc
//!
//! Pure functions are kept apart from I/O so the decision logic can be tested
//! without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - connection state, backoff and rumqttc option building
//! - [`session_state`] - pure state transitions and reconnect decisions
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`acks`] - correlation of PUBACK/SUBACK with waiting callers
//! - [`client`] - the [`ConnectionManager`] that does the actual I/O
//!
//! # Usage
//!
//! ```rust,no_run
//! use bus_core::config::ClientConfig;
//! use bus_core::metrics::ClientMetrics;
//! use bus_core::subscription::SubscriptionRegistry;
//! use bus_core::transport::mqtt::ConnectionManager;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::new("mqtt://localhost:1883", "stt")?;
//! let (manager, _inbound) = ConnectionManager::new(
//!     config,
//!     SubscriptionRegistry::shared(),
//!     Arc::new(ClientMetrics::new()),
//! )?;
//! manager.start();
//! manager.wait_connected(Duration::from_secs(5)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod acks;
pub mod client;
pub mod connection;
pub mod message_handler;
pub mod session_state;

pub use acks::{AckKind, AckTracker};
pub use client::ConnectionManager;
pub use connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
pub use message_handler::{EventRoute, MessageHandler};
pub use session_state::{ReconnectionDecision, SessionEvent, SessionState, SubscribeAction};
