//! Bounded TTL cache of recently seen envelope identities
//!
//! Identity is `{type}|{id}|seq={seq}` when a sequence number is present and
//! `{type}|{id}|hash={sha256(data)}` otherwise. The window starts at first
//! sighting; repeats inside it do not extend it.

use crate::protocol::Envelope;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Suppresses redelivered envelopes
#[derive(Debug)]
pub struct Deduplicator {
    window: Option<Window>,
}

#[derive(Debug)]
struct Window {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl Deduplicator {
    /// `ttl` of `None` disables deduplication entirely
    pub fn new(ttl: Option<Duration>, max_entries: usize) -> Self {
        let window = ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| Window {
            ttl,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        });
        Self { window }
    }

    /// Pass-through instance
    pub fn disabled() -> Self {
        Self { window: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.window.is_some()
    }

    /// Record `envelope` and report whether it was already seen in the window
    pub fn is_duplicate(&mut self, envelope: &Envelope) -> bool {
        self.is_duplicate_at(envelope, Instant::now())
    }

    /// As [`is_duplicate`](Self::is_duplicate) with an explicit clock
    pub fn is_duplicate_at(&mut self, envelope: &Envelope, now: Instant) -> bool {
        let Some(window) = self.window.as_mut() else {
            return false;
        };

        let key = identity_key(envelope);
        window.evict_expired(now);

        if window.seen.contains_key(&key) {
            debug!(envelope_id = %envelope.id, "Duplicate envelope suppressed");
            return true;
        }

        window.seen.insert(key.clone(), now);
        window.order.push_back((key, now));
        window.evict_overflow();
        false
    }

    /// Number of identities currently remembered
    pub fn len(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.seen.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Window {
    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, first_seen)) = self.order.front() {
            if now.saturating_duration_since(*first_seen) < self.ttl {
                break;
            }
            if let Some((key, first_seen)) = self.order.pop_front() {
                self.forget(&key, first_seen);
            }
        }
    }

    fn evict_overflow(&mut self) {
        while self.seen.len() > self.max_entries {
            match self.order.pop_front() {
                Some((key, first_seen)) => self.forget(&key, first_seen),
                None => break,
            }
        }
    }

    fn forget(&mut self, key: &str, first_seen: Instant) {
        if self.seen.get(key) == Some(&first_seen) {
            self.seen.remove(key);
        }
    }
}

/// Identity key used for deduplication
pub fn identity_key(envelope: &Envelope) -> String {
    match envelope.seq {
        Some(seq) => format!("{}|{}|seq={seq}", envelope.event_type, envelope.id),
        None => {
            // serde_json maps keep keys sorted, so equal data hashes equally
            let bytes = serde_json::to_vec(&envelope.data).unwrap_or_default();
            let digest = hex::encode(Sha256::digest(&bytes));
            format!("{}|{}|hash={digest}", envelope.event_type, envelope.id)
        }
    }
}
