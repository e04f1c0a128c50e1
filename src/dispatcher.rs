//! Sequential delivery of inbound messages to subscription handlers
//!
//! One message at a time: decode, deduplicate, look up matching bindings,
//! then run each handler to completion before the next. A handler error or
//! panic is logged with topic and envelope id and never stops delivery to
//! the other handlers or to later messages.

use crate::dedupe::Deduplicator;
use crate::metrics::ClientMetrics;
use crate::protocol::EnvelopeCodec;
use crate::subscription::SharedRegistry;
use crate::transport::InboundMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to this many handlers (including ones that failed)
    Delivered(usize),
    Duplicate,
    DecodeFailed,
    NoSubscribers,
    /// Shutdown arrived while a handler was still running
    Interrupted,
}

pub struct Dispatcher {
    registry: SharedRegistry,
    dedupe: Deduplicator,
    metrics: Arc<ClientMetrics>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        registry: SharedRegistry,
        dedupe: Deduplicator,
        metrics: Arc<ClientMetrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            dedupe,
            metrics,
            shutdown_rx,
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Drain `inbound` until shutdown or until every sender is gone
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        info!("Dispatcher started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if self.shutdown_requested() {
                break;
            }

            let message = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if self.dispatch(message).await == DispatchOutcome::Interrupted {
                break;
            }
        }

        info!("Dispatcher stopped");
    }

    /// Process a single message end to end
    pub async fn dispatch(&mut self, message: InboundMessage) -> DispatchOutcome {
        self.metrics.message_received();

        let envelope = match EnvelopeCodec::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.decode_failed();
                warn!(topic = %message.topic, error = %e, "Dropping undecodable message");
                return DispatchOutcome::DecodeFailed;
            }
        };

        if self.dedupe.is_duplicate(&envelope) {
            self.metrics.duplicate_dropped();
            return DispatchOutcome::Duplicate;
        }

        // Lock released before any handler runs so handlers may subscribe
        let handlers = self.registry.read().await.matching(&message.topic);
        if handlers.is_empty() {
            debug!(topic = %message.topic, envelope_id = %envelope.id, "No handler matches topic");
            return DispatchOutcome::NoSubscribers;
        }

        let span = crate::bus_span!(
            topic = %message.topic,
            envelope_id = %envelope.id,
            event_type = %envelope.event_type,
            retained = message.retain,
        );

        let delivered = handlers.len();
        for handler in handlers {
            let topic = message.topic.clone();
            let envelope_id = envelope.id.clone();
            let call = {
                let topic = topic.clone();
                let envelope = envelope.clone();
                async move { handler.handle(topic, envelope).await }
            };
            let mut task = tokio::spawn(call.instrument(span.clone()));

            let mut shutdown_rx = self.shutdown_rx.clone();
            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    task.abort();
                    warn!(topic = %topic, envelope_id = %envelope_id, "Handler abandoned at shutdown");
                    return DispatchOutcome::Interrupted;
                }
            };

            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.metrics.handler_failed();
                    error!(topic = %topic, envelope_id = %envelope_id, error = %e, "Handler failed");
                }
                Err(e) => {
                    self.metrics.handler_failed();
                    error!(topic = %topic, envelope_id = %envelope_id, error = %e, "Handler panicked");
                }
            }
        }

        self.metrics.message_dispatched();
        DispatchOutcome::Delivered(delivered)
    }
}
