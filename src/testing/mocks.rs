//! Mock implementations for testing
//!
//! Provides a recording [`Transport`] and a recording [`EnvelopeHandler`] so
//! health, heartbeat and dispatch logic can be exercised without a broker.

use crate::error::{BusError, BusResult};
use crate::protocol::Envelope;
use crate::subscription::{EnvelopeHandler, HandlerResult};
use crate::transport::{ConnectionState, Qos, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// One publish seen by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<ConnectionState>,
    published: Mutex<Vec<PublishedMessage>>,
    should_fail: AtomicBool,
    reconnect_requests: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connected),
            published: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
            reconnect_requests: AtomicUsize::new(0),
        }
    }
}

impl MockTransport {
    /// Connected transport that records every publish
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnected() -> Self {
        let transport = Self::default();
        transport.set_state(ConnectionState::Disconnected);
        transport
    }

    /// Connected transport whose publishes all fail
    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn reconnect_requests(&self) -> usize {
        self.reconnect_requests.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> BusResult<()> {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(BusError::NotConnected { state });
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(BusError::publish_failed("Mock publish failure"));
        }

        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn request_reconnect(&self, _reason: &str) {
        self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handler that records every envelope it receives
#[derive(Debug, Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<(String, Envelope)>>,
    fail_with: Option<String>,
    delay: Option<Duration>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records, then returns an error with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Sleeps for `delay` before recording
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<(String, Envelope)> {
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Wait until at least `n` envelopes arrived or `timeout` elapsed
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.count() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= n;
            }
        }
    }
}

#[async_trait]
impl EnvelopeHandler for RecordingHandler {
    async fn handle(&self, topic: String, envelope: Envelope) -> HandlerResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((topic, envelope));
        self.notify.notify_waiters();

        match &self.fail_with {
            Some(message) => Err(message.clone().into()),
            None => Ok(()),
        }
    }
}
