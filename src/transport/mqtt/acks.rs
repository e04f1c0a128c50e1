//! Correlation of QoS 1 publishes and subscribes with broker acknowledgements
//!
//! rumqttc assigns packet ids inside the event loop, after the request has
//! left the caller. Requests are processed strictly in channel order, so a
//! FIFO of waiters registered at enqueue time lines up with the
//! `Outgoing::Publish(pkid)` / `Outgoing::Subscribe(pkid)` events the loop
//! reports. Once the id is known the waiter moves into a map keyed by it and
//! the matching PUBACK/SUBACK resolves it.
//!
//! Registration must happen under the same lock that serializes enqueueing,
//! otherwise the FIFO order drifts from the channel order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Broker verdict: `Err` carries the rejection reason
pub type AckOutcome = Result<(), String>;

/// Waiting side of one acknowledgement
pub type AckReceiver = oneshot::Receiver<AckOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Publish,
    Subscribe,
}

#[derive(Default)]
struct Pending {
    queued: VecDeque<oneshot::Sender<AckOutcome>>,
    in_flight: HashMap<u16, oneshot::Sender<AckOutcome>>,
}

impl Pending {
    fn clear(&mut self) -> usize {
        let dropped = self.queued.len() + self.in_flight.len();
        self.queued.clear();
        self.in_flight.clear();
        dropped
    }
}

#[derive(Default)]
struct Inner {
    publishes: Pending,
    subscribes: Pending,
}

impl Inner {
    fn pending(&mut self, kind: AckKind) -> &mut Pending {
        match kind {
            AckKind::Publish => &mut self.publishes,
            AckKind::Subscribe => &mut self.subscribes,
        }
    }
}

/// Tracks outstanding acknowledgements for the current connection
#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a waiter for the next request of `kind` about to be enqueued
    pub fn register(&self, kind: AckKind) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        self.lock().pending(kind).queued.push_back(tx);
        rx
    }

    /// Withdraw the most recent registration after a failed enqueue
    pub fn cancel_last(&self, kind: AckKind) {
        self.lock().pending(kind).queued.pop_back();
    }

    /// The event loop sent the oldest queued request with `packet_id`
    pub fn assign(&self, kind: AckKind, packet_id: u16) {
        let mut inner = self.lock();
        let pending = inner.pending(kind);
        match pending.queued.pop_front() {
            Some(waiter) => {
                pending.in_flight.insert(packet_id, waiter);
            }
            None => debug!(?kind, packet_id, "Sent packet has no registered waiter"),
        }
    }

    /// Resolve the waiter for `packet_id`
    pub fn resolve(&self, kind: AckKind, packet_id: u16, outcome: AckOutcome) {
        let waiter = self.lock().pending(kind).in_flight.remove(&packet_id);
        match waiter {
            // Receiver may have timed out already
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(?kind, packet_id, "Acknowledgement for unknown packet id"),
        }
    }

    /// Fail every outstanding waiter; called whenever the connection is replaced
    pub fn reset(&self) -> usize {
        let mut inner = self.lock();
        inner.publishes.clear() + inner.subscribes.clear()
    }

    /// Outstanding waiters of `kind`, queued and in flight
    pub fn outstanding(&self, kind: AckKind) -> usize {
        let mut inner = self.lock();
        let pending = inner.pending(kind);
        pending.queued.len() + pending.in_flight.len()
    }
}
