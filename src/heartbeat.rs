//! Periodic liveness broadcast with a half-open connection watchdog
//!
//! Publishes a bare [`HeartbeatPayload`] to `system/keepalive/{client_id}` at
//! QoS 0 without retain. Transport keepalive can take a long time to notice a
//! half-open socket, so three consecutive publish failures make the monitor
//! ask the session owner to tear the connection down and start over.

use crate::protocol::{HeartbeatPayload, TopicBuilder};
use crate::transport::{Qos, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Consecutive failures that trigger a forced reconnect
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// What a single beat did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatOutcome {
    Sent,
    /// Publish failed; carries the consecutive failure count
    Failed(u32),
    /// Failure threshold reached and a reconnect was requested
    ReconnectRequested,
    /// Not connected; nothing attempted
    Skipped,
}

pub struct HeartbeatMonitor {
    transport: Arc<dyn Transport>,
    topic: String,
    interval: Duration,
    consecutive_failures: u32,
}

impl HeartbeatMonitor {
    pub fn new(transport: Arc<dyn Transport>, client_id: &str, interval: Duration) -> Self {
        Self {
            transport,
            topic: TopicBuilder::keepalive_topic(client_id),
            interval,
            consecutive_failures: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Publish one heartbeat and update the watchdog
    pub async fn beat(&mut self) -> BeatOutcome {
        // Reconnection is already underway; failures here say nothing new
        if !self.transport.is_connected() {
            self.consecutive_failures = 0;
            return BeatOutcome::Skipped;
        }

        let payload = match serde_json::to_vec(&HeartbeatPayload::now()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode heartbeat");
                return self.record_failure();
            }
        };

        match self
            .transport
            .publish(&self.topic, payload, Qos::AtMostOnce, false)
            .await
        {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!(topic = %self.topic, "Heartbeat sent");
                BeatOutcome::Sent
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Heartbeat publish failed");
                self.record_failure()
            }
        }
    }

    fn record_failure(&mut self) -> BeatOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures < MAX_CONSECUTIVE_FAILURES {
            return BeatOutcome::Failed(self.consecutive_failures);
        }

        warn!(
            failures = self.consecutive_failures,
            "Heartbeat watchdog forcing reconnect"
        );
        self.transport
            .request_reconnect("consecutive heartbeat failures");
        self.consecutive_failures = 0;
        BeatOutcome::ReconnectRequested
    }

    /// Beat every interval until `shutdown_rx` flips to `true`
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(topic = %self.topic, interval_ms = self.interval.as_millis() as u64, "Heartbeat started");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }

        info!(topic = %self.topic, "Heartbeat stopped");
    }
}
