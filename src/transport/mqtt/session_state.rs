//! Pure session state transitions and reconnection decisions
//!
//! Nothing in here performs I/O; the supervisor in [`super::client`] feeds
//! events in and acts on the decisions that come out.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{debug, info};

/// Pure state machine for the broker session
pub struct SessionState;

impl SessionState {
    /// Decide whether to reconnect after losing the session (pure function)
    ///
    /// Transient failures are retried forever; only an explicit close stops
    /// the loop.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        closing: bool,
    ) -> ReconnectionDecision {
        if closing {
            return ReconnectionDecision::AbortClosing;
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts.saturating_add(1),
            delay: config.calculate_backoff_delay(current_attempts),
        }
    }

    /// Determine next state after a session event (pure function)
    pub fn determine_next_state(current: ConnectionState, event: &SessionEvent) -> ConnectionState {
        match event {
            SessionEvent::ConnectRequested => match current {
                ConnectionState::Disconnected => ConnectionState::Connecting,
                other => other,
            },
            // Readiness is only declared once the replay has finished
            SessionEvent::ConnAckReceived => current,
            SessionEvent::SubscriptionsRestored => ConnectionState::Connected,
            SessionEvent::ConnectionLost(_) | SessionEvent::ReconnectForced(_) => match current {
                ConnectionState::Reconnecting(attempt) => ConnectionState::Reconnecting(attempt),
                _ => ConnectionState::Reconnecting(0),
            },
            SessionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(*attempt),
            SessionEvent::Closed => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// How a caller-initiated subscribe should be handled (pure function)
    pub fn subscribe_action(state: ConnectionState) -> SubscribeAction {
        match state {
            ConnectionState::Connected => SubscribeAction::Issue,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {
                SubscribeAction::Defer
            }
            ConnectionState::Disconnected => SubscribeAction::Reject,
        }
    }

    /// Whether a watchdog request should tear down the session (pure function)
    pub fn should_force_reconnect(state: ConnectionState, closing: bool) -> bool {
        !closing && matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        if from == to {
            return;
        }
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker session established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempts = attempt, "Reconnection successful");
            }
            (_, ConnectionState::Disconnected) => {
                info!("Broker session closed");
            }
            _ => {
                debug!(from = %from, to = %to, "Connection state changed");
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Wait `delay` then start attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// The owner is closing the session
    AbortClosing,
}

/// Caller subscribe handling for the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Send SUBSCRIBE now and wait for SUBACK
    Issue,
    /// Record only; the post-connect replay sends it
    Defer,
    /// No session is running
    Reject,
}

/// Events that drive session state transitions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectRequested,
    ConnAckReceived,
    SubscriptionsRestored,
    ConnectionLost(String),
    ReconnectForced(String),
    ReconnectionStarted(u32),
    Closed,
}
