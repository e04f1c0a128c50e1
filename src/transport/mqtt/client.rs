//! Impure I/O for the broker session
//!
//! [`ConnectionManager`] owns the rumqttc event loop through a supervisor
//! task. The supervisor polls the loop, routes every event, and on any
//! failure swaps in a fresh client and event loop after an exponential
//! backoff. After each handshake it replays the subscription registry in
//! registration order and only then reports `Connected`.
//!
//! All writes go through one `Mutex<AsyncClient>` using the non-blocking
//! `try_*` requests, so no writer ever waits on the event loop while holding
//! the lock and the supervisor can always take it to swap connections.

use super::acks::{AckKind, AckReceiver, AckTracker};
use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::message_handler::{EventRoute, MessageHandler};
use super::session_state::{ReconnectionDecision, SessionEvent, SessionState, SubscribeAction};
use crate::config::{ClientConfig, ConnectionParams};
use crate::error::{sanitize_error_message, BusError, BusResult};
use crate::health;
use crate::metrics::ClientMetrics;
use crate::protocol::topics::{validate_topic_filter, validate_topic_name};
use crate::protocol::{events, EnvelopeCodec, HealthStatus, TopicBuilder};
use crate::subscription::{EnvelopeHandler, SharedRegistry};
use crate::transport::{InboundMessage, Qos, Transport};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long `disconnect` waits for DISCONNECT to be written
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `disconnect` waits for the supervisor to wind down
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the manager, its supervisor and replay tasks
struct Session {
    config: ClientConfig,
    params: ConnectionParams,
    options: MqttOptions,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    acks: AckTracker,
    registry: SharedRegistry,
    metrics: Arc<ClientMetrics>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    health_codec: EnvelopeCodec,
    closing: AtomicBool,
    ever_connected: AtomicBool,
    generation: AtomicU64,
    force_reconnect: Notify,
    disconnect_sent: Notify,
}

impl Session {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn transition(&self, event: SessionEvent) -> ConnectionState {
        let mut from = ConnectionState::Disconnected;
        let mut to = ConnectionState::Disconnected;
        self.state_tx.send_modify(|state| {
            from = *state;
            *state = SessionState::determine_next_state(*state, &event);
            to = *state;
        });
        SessionState::log_state_transition(from, to);
        to
    }

    /// A new client and its event loop, not yet visible to writers
    fn fresh_client(&self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.options.clone(), self.config.request_queue_capacity)
    }

    /// Swap in `client` for writers and fail every outstanding waiter of
    /// the previous connection
    async fn install_client(&self, client: AsyncClient) {
        let mut guard = self.client.lock().await;
        *guard = client;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let failed = self.acks.reset();
        if failed > 0 {
            debug!(failed, "Failed acknowledgement waiters of the previous connection");
        }
    }

    async fn await_ack(&self, kind: AckKind, topic: &str, waiter: AckReceiver) -> BusResult<()> {
        let operation = match kind {
            AckKind::Publish => "publish",
            AckKind::Subscribe => "subscribe",
        };
        let timeout = self.config.ack_timeout();

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(match kind {
                AckKind::Publish => BusError::publish_failed(reason),
                AckKind::Subscribe => BusError::subscription_failed(reason),
            }),
            Ok(Err(_)) => Err(BusError::ConnectionLost {
                operation,
                topic: topic.to_string(),
            }),
            Err(_) => Err(BusError::AckTimeout {
                operation,
                topic: topic.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> BusResult<()> {
        validate_topic_name(topic)?;

        let waiter = {
            let client = self.client.lock().await;
            // Checked under the lock: connection swaps happen under it too
            let state = self.state();
            if !SessionState::can_publish(state) {
                return Err(BusError::NotConnected { state });
            }

            let waiter = (qos == Qos::AtLeastOnce).then(|| self.acks.register(AckKind::Publish));
            if let Err(e) = client.try_publish(topic, qos.into(), retain, payload) {
                if waiter.is_some() {
                    self.acks.cancel_last(AckKind::Publish);
                }
                self.metrics.publish_failed();
                return Err(BusError::publish_failed(e));
            }
            waiter
        };

        if let Some(waiter) = waiter {
            if let Err(e) = self.await_ack(AckKind::Publish, topic, waiter).await {
                self.metrics.publish_failed();
                return Err(e);
            }
        }

        self.metrics.message_published();
        trace!(topic, qos = qos.level(), retain, "Published");
        Ok(())
    }

    async fn enqueue_subscribe(&self, pattern: &str, qos: Qos) -> BusResult<AckReceiver> {
        let client = self.client.lock().await;
        let waiter = self.acks.register(AckKind::Subscribe);
        if let Err(e) = client.try_subscribe(pattern, qos.into()) {
            self.acks.cancel_last(AckKind::Subscribe);
            return Err(BusError::subscription_failed(e));
        }
        Ok(waiter)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EnvelopeHandler>,
        qos: Qos,
    ) -> BusResult<()> {
        validate_topic_filter(pattern)?;

        // Holding the write lock orders this against a running replay: either
        // the replay sees the binding, or we see `Connected` and send it
        let waiter = {
            let mut registry = self.registry.write().await;
            let state = self.state();
            match SessionState::subscribe_action(state) {
                SubscribeAction::Reject => return Err(BusError::NotConnected { state }),
                SubscribeAction::Defer => {
                    registry.insert(pattern, handler, qos)?;
                    debug!(pattern, state = %state, "Subscription recorded for replay");
                    return Ok(());
                }
                SubscribeAction::Issue => {
                    registry.insert(pattern, handler, qos)?;
                    match self.enqueue_subscribe(pattern, qos).await {
                        Ok(waiter) => waiter,
                        Err(e) => {
                            registry.remove(pattern);
                            return Err(e);
                        }
                    }
                }
            }
        };

        // A binding the broker never confirmed must not be replayed later
        match self.await_ack(AckKind::Subscribe, pattern, waiter).await {
            Ok(()) => {
                debug!(pattern, qos = qos.level(), "Subscribed");
                Ok(())
            }
            Err(e) => {
                warn!(pattern, error = %e, "Subscription not confirmed, dropping binding");
                self.registry.write().await.remove(pattern);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, pattern: &str) -> BusResult<bool> {
        let mut registry = self.registry.write().await;
        if registry.remove(pattern).is_none() {
            return Ok(false);
        }

        if self.state() == ConnectionState::Connected {
            let client = self.client.lock().await;
            client
                .try_unsubscribe(pattern)
                .map_err(BusError::subscription_failed)?;
        }
        debug!(pattern, "Unsubscribed");
        Ok(true)
    }

    /// Re-issue every binding in registration order, then declare readiness
    async fn restore_subscriptions(self: Arc<Self>, generation: u64) {
        let registry = self.registry.read().await;
        let plan = registry.replay_plan();

        let mut waiters = Vec::with_capacity(plan.len());
        for (pattern, qos) in &plan {
            match self.enqueue_subscribe(pattern, *qos).await {
                Ok(waiter) => waiters.push((pattern, waiter)),
                Err(e) => error!(pattern = %pattern, error = %e, "Failed to re-issue subscription"),
            }
        }
        for (pattern, waiter) in waiters {
            if let Err(e) = self.await_ack(AckKind::Subscribe, pattern, waiter).await {
                warn!(pattern = %pattern, error = %e, "Re-issued subscription not confirmed");
            }
        }

        if self.generation.load(Ordering::SeqCst) != generation || self.is_closing() {
            debug!("Connection replaced during replay, not declaring readiness");
            return;
        }
        self.transition(SessionEvent::SubscriptionsRestored);
        drop(registry);

        info!(subscriptions = plan.len(), "Broker session ready");

        if self.ever_connected.swap(true, Ordering::SeqCst) {
            self.metrics.reconnected();
            if self.config.enable_health {
                self.publish_reconnected().await;
            }
        }
    }

    async fn publish_reconnected(&self) {
        let status = HealthStatus::event(true, events::RECONNECTED);
        let payload = match health::encode_health(&self.health_codec, &status) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode reconnect health status");
                return;
            }
        };
        let topic = TopicBuilder::health_topic(&self.config.client_id);
        if let Err(e) = self.publish(&topic, payload, Qos::AtLeastOnce, true).await {
            warn!(error = %e, "Failed to publish reconnect health status");
        }
    }
}

/// Owns the event loop for one run of the session
struct Supervisor {
    session: Arc<Session>,
    event_loop: EventLoop,
    reconnect: ReconnectConfig,
    attempts: u32,
    replay: Option<JoinHandle<()>>,
    stop_rx: watch::Receiver<bool>,
}

/// Whether the supervisor loop keeps going
enum Flow {
    Continue,
    Stop,
}

impl Supervisor {
    async fn run(mut self) {
        info!(
            client_id = %self.session.config.client_id,
            broker = %self.session.params,
            "Starting session supervisor"
        );

        loop {
            let flow = tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
                _ = self.session.force_reconnect.notified() => {
                    let state = self.session.state();
                    if SessionState::should_force_reconnect(state, self.session.is_closing()) {
                        let reason = "forced by heartbeat watchdog".to_string();
                        self.handle_connection_loss(SessionEvent::ReconnectForced(reason)).await
                    } else {
                        Flow::Continue
                    }
                }
                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => {
                        let reason = sanitize_error_message(&e.to_string());
                        self.handle_connection_loss(SessionEvent::ConnectionLost(reason)).await
                    }
                },
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        if let Some(replay) = self.replay.take() {
            replay.abort();
        }
        self.session.acks.reset();
        self.session.transition(SessionEvent::Closed);
        info!(client_id = %self.session.config.client_id, "Session supervisor stopped");
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged => {
                self.session.transition(SessionEvent::ConnAckReceived);
                self.attempts = 0;
                if let Some(previous) = self.replay.take() {
                    previous.abort();
                }
                let generation = self.session.generation.load(Ordering::SeqCst);
                let session = Arc::clone(&self.session);
                self.replay = Some(tokio::spawn(session.restore_subscriptions(generation)));
            }
            EventRoute::MessageReceived(message) => {
                trace!(topic = %message.topic, bytes = message.payload.len(), "Inbound message");
                if self.session.inbound_tx.send(message).is_err() {
                    debug!("Dispatcher gone, inbound message dropped");
                }
            }
            EventRoute::Disconnected(reason) => {
                let reason = format!("broker sent DISCONNECT: {reason}");
                return self
                    .handle_connection_loss(SessionEvent::ConnectionLost(reason))
                    .await;
            }
            EventRoute::SubscriptionAcknowledged { packet_id, outcome } => {
                self.session.acks.resolve(AckKind::Subscribe, packet_id, outcome);
            }
            EventRoute::PublishAcknowledged { packet_id, outcome } => {
                self.session.acks.resolve(AckKind::Publish, packet_id, outcome);
            }
            EventRoute::PublishSent(packet_id) => {
                self.session.acks.assign(AckKind::Publish, packet_id);
            }
            EventRoute::SubscribeSent(packet_id) => {
                self.session.acks.assign(AckKind::Subscribe, packet_id);
            }
            EventRoute::DisconnectSent => {
                self.session.disconnect_sent.notify_waiters();
                if self.session.is_closing() {
                    return Flow::Stop;
                }
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(event = %event, "Broker event");
            }
            EventRoute::OutgoingEvent => {}
        }
        Flow::Continue
    }

    async fn handle_connection_loss(&mut self, event: SessionEvent) -> Flow {
        if self.session.is_closing() {
            return Flow::Stop;
        }

        if let SessionEvent::ConnectionLost(reason) | SessionEvent::ReconnectForced(reason) = &event {
            if self.session.state() == ConnectionState::Connected {
                warn!(reason = %reason, "Broker session lost");
            } else {
                debug!(reason = %reason, attempt = self.attempts, "Connection attempt failed");
            }
        }
        self.session.transition(event);

        if let Some(replay) = self.replay.take() {
            replay.abort();
        }
        let (client, event_loop) = self.session.fresh_client();
        self.session.install_client(client).await;
        self.event_loop = event_loop;

        match SessionState::should_attempt_reconnection(
            self.attempts,
            &self.reconnect,
            self.session.is_closing(),
        ) {
            ReconnectionDecision::AbortClosing => Flow::Stop,
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.attempts = attempt;
                self.session.transition(SessionEvent::ReconnectionStarted(attempt));
                info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to broker");

                tokio::select! {
                    changed = self.stop_rx.changed() => {
                        if changed.is_err() || *self.stop_rx.borrow() {
                            return Flow::Stop;
                        }
                        Flow::Continue
                    }
                    _ = tokio::time::sleep(delay) => Flow::Continue,
                }
            }
        }
    }
}

struct SupervisorRun {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owner of the broker session
pub struct ConnectionManager {
    session: Arc<Session>,
    reconnect: ReconnectConfig,
    run: std::sync::Mutex<Option<SupervisorRun>>,
}

impl ConnectionManager {
    /// Validate configuration and prepare the session without connecting
    ///
    /// Returns the receiving end of the inbound message queue, which the
    /// dispatcher drains.
    pub fn new(
        config: ClientConfig,
        registry: SharedRegistry,
        metrics: Arc<ClientMetrics>,
    ) -> BusResult<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        config.validate()?;
        let params = config.connection_params()?;
        let options = configure_mqtt_options(&config, &params)?;

        // Placeholder until the first connect swaps in a live one
        let (client, _unused_event_loop) =
            AsyncClient::new(options.clone(), config.request_queue_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = Session {
            health_codec: EnvelopeCodec::new(config.source_name()),
            config: config.clone(),
            params,
            options,
            client: Arc::new(Mutex::new(client)),
            state_tx,
            acks: AckTracker::new(),
            registry,
            metrics,
            inbound_tx,
            closing: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            force_reconnect: Notify::new(),
            disconnect_sent: Notify::new(),
        };

        let manager = Self {
            session: Arc::new(session),
            reconnect: ReconnectConfig::from_config(&config),
            run: std::sync::Mutex::new(None),
        };
        Ok((manager, inbound_rx))
    }

    fn run_slot(&self) -> std::sync::MutexGuard<'_, Option<SupervisorRun>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the supervisor; a no-op while one is already running
    ///
    /// Returns `true` when this call started it. The check and the spawn
    /// happen under one lock so concurrent callers cannot both start one.
    pub fn start(&self) -> bool {
        let mut slot = self.run_slot();
        if slot.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            return false;
        }

        self.session.closing.store(false, Ordering::SeqCst);
        let (client, event_loop) = self.session.fresh_client();
        self.session.transition(SessionEvent::ConnectRequested);

        let (stop_tx, stop_rx) = watch::channel(false);
        let session = Arc::clone(&self.session);
        let supervisor = Supervisor {
            session: Arc::clone(&self.session),
            event_loop,
            reconnect: self.reconnect,
            attempts: 0,
            replay: None,
            stop_rx,
        };
        let handle = tokio::spawn(async move {
            session.install_client(client).await;
            supervisor.run().await;
        });
        *slot = Some(SupervisorRun { stop_tx, handle });
        true
    }

    /// Wait until the session reports `Connected`
    pub async fn wait_connected(&self, timeout: Duration) -> BusResult<()> {
        let mut state_rx = self.session.state_tx.subscribe();
        let result = match tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::NotConnected {
                state: self.session.state(),
            }),
            Err(_) => Err(BusError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        result
    }

    /// Close the session: send DISCONNECT if connected, then stop the
    /// supervisor. The subscription registry is left untouched.
    pub async fn disconnect(&self) {
        self.session.closing.store(true, Ordering::SeqCst);
        let run = self.run_slot().take();
        let Some(mut run) = run else {
            self.session.transition(SessionEvent::Closed);
            return;
        };

        if self.session.state() == ConnectionState::Connected {
            let flushed = self.session.disconnect_sent.notified();
            let requested = {
                let client = self.session.client.lock().await;
                client.try_disconnect().is_ok()
            };
            if requested && tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flushed).await.is_err() {
                debug!("DISCONNECT not confirmed before timeout");
            }
        }

        let _ = run.stop_tx.send(true);
        if tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, &mut run.handle)
            .await
            .is_err()
        {
            warn!("Session supervisor did not stop in time, aborting");
            run.handle.abort();
        }

        self.session.acks.reset();
        // The next connect starts a fresh session, not a reconnection
        self.session.ever_connected.store(false, Ordering::SeqCst);
        self.session.transition(SessionEvent::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Watch channel of connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_tx.subscribe()
    }

    pub fn supervisor_active(&self) -> bool {
        self.run_slot()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Record a binding and subscribe, or defer it while (re)connecting
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EnvelopeHandler>,
        qos: Qos,
    ) -> BusResult<()> {
        self.session.subscribe(pattern, handler, qos).await
    }

    /// Drop a binding; `false` when the pattern was not registered
    pub async fn unsubscribe(&self, pattern: &str) -> BusResult<bool> {
        self.session.unsubscribe(pattern).await
    }

    /// The shared rumqttc client; its contents are replaced on reconnect
    pub fn raw_client(&self) -> Arc<Mutex<AsyncClient>> {
        Arc::clone(&self.session.client)
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.session.params
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> BusResult<()> {
        self.session.publish(topic, payload, qos, retain).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    fn request_reconnect(&self, reason: &str) {
        if SessionState::should_force_reconnect(self.session.state(), self.session.is_closing()) {
            warn!(reason, "Reconnect requested");
            self.session.force_reconnect.notify_one();
        } else {
            debug!(reason, "Reconnect request ignored, session not connected");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(run) = self.run_slot().take() {
            run.handle.abort();
        }
    }
}
