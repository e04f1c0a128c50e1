//! Topic pattern to handler bindings
//!
//! The registry is independent of connection state: it is the source of truth
//! the session replays after every reconnect, in registration order.

use crate::protocol::topics::{topic_matches, validate_topic_filter, TopicError};
use crate::protocol::Envelope;
use crate::transport::Qos;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Error returned by a handler; logged by the dispatcher, never propagated
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// Receives decoded envelopes for a matching topic pattern
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, topic: String, envelope: Envelope) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EnvelopeHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(String, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, topic: String, envelope: Envelope) -> HandlerResult {
        (self.f)(topic, envelope).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```rust
/// use bus_core::subscription::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|topic, envelope| async move {
///     println!("{topic}: {}", envelope.event_type);
///     Ok::<(), HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(String, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// One pattern binding
#[derive(Clone)]
pub struct Subscription {
    pub pattern: String,
    pub handler: Arc<dyn EnvelopeHandler>,
    pub qos: Qos,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Registry shared by the session supervisor, the dispatcher and callers
pub type SharedRegistry = Arc<RwLock<SubscriptionRegistry>>;

/// Ordered set of pattern bindings; one binding per exact pattern
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a binding; re-registering a pattern replaces its handler and
    /// QoS but keeps its place in the replay order
    ///
    /// Returns `true` when an existing binding was replaced.
    pub fn insert(
        &mut self,
        pattern: &str,
        handler: Arc<dyn EnvelopeHandler>,
        qos: Qos,
    ) -> Result<bool, TopicError> {
        validate_topic_filter(pattern)?;

        if let Some(existing) = self.entries.iter_mut().find(|s| s.pattern == pattern) {
            existing.handler = handler;
            existing.qos = qos;
            return Ok(true);
        }

        self.entries.push(Subscription {
            pattern: pattern.to_string(),
            handler,
            qos,
        });
        Ok(false)
    }

    pub fn remove(&mut self, pattern: &str) -> Option<Subscription> {
        let idx = self.entries.iter().position(|s| s.pattern == pattern)?;
        Some(self.entries.remove(idx))
    }

    /// Handlers of every binding matching `topic`, in registration order
    pub fn matching(&self, topic: &str) -> Vec<Arc<dyn EnvelopeHandler>> {
        self.entries
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    /// `(pattern, qos)` pairs to re-issue after a reconnect
    pub fn replay_plan(&self) -> Vec<(String, Qos)> {
        self.entries
            .iter()
            .map(|s| (s.pattern.clone(), s.qos))
            .collect()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.iter().any(|s| s.pattern == pattern)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
