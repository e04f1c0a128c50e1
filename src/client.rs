//! The facade every service embeds
//!
//! [`BusClient`] ties the pieces together: one [`ConnectionManager`] owning
//! the broker session, one [`Dispatcher`] task delivering inbound envelopes,
//! an optional [`HeartbeatMonitor`], and a [`HealthReporter`] for lifecycle
//! status. All methods take `&self`, so a client can be shared behind an
//! `Arc` and published to from many tasks at once.
//!
//! ```rust,no_run
//! use bus_core::{handler_fn, BusClient, ClientConfig, HandlerError, Qos};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let client = BusClient::new(ClientConfig::new("mqtt://localhost:1883", "stt")?)?;
//! client.connect().await?;
//!
//! client
//!     .subscribe(
//!         "wake/#",
//!         handler_fn(|topic, envelope| async move {
//!             println!("{topic}: {}", envelope.event_type);
//!             Ok::<(), HandlerError>(())
//!         }),
//!         Qos::AtLeastOnce,
//!     )
//!     .await?;
//!
//! client
//!     .publish_event("stt/transcript", "stt.final", &json!({"text": "hello"}))
//!     .await?;
//! client.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use crate::config::ClientConfig;
use crate::dedupe::Deduplicator;
use crate::dispatcher::Dispatcher;
use crate::error::{BusError, BusResult};
use crate::health::HealthReporter;
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::protocol::{events, Envelope, EnvelopeCodec};
use crate::subscription::{EnvelopeHandler, SharedRegistry, SubscriptionRegistry};
use crate::transport::mqtt::ConnectionManager;
use crate::transport::{ConnectionState, InboundMessage, Qos, Transport};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period for background tasks at shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Optional envelope fields and delivery settings for a publish
///
/// The default publishes at QoS 0, not retained, with neither `correlate`
/// nor `seq` set.
///
/// ```
/// use bus_core::{PublishOptions, Qos};
///
/// let options = PublishOptions::default()
///     .with_correlation("req-42")
///     .with_seq(3)
///     .with_qos(Qos::AtLeastOnce);
/// assert_eq!(options.seq, Some(3));
/// assert!(!options.retain);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Copied into the envelope's `correlate` key
    pub correlation_id: Option<String>,
    /// Copied into the envelope's `seq` key
    pub seq: Option<i64>,
    pub qos: Qos,
    /// Ask the broker to keep this as the topic's last known value
    pub retain: bool,
}

impl PublishOptions {
    /// Tie the envelope to an earlier one, typically a request's `id`
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Producer-assigned ordering number; negative values are allowed
    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// QoS 1 makes the publish wait for the broker's PUBACK
    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Publish with the retain flag set
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

struct HeartbeatTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BackgroundTasks {
    dispatcher: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatTask>,
}

/// Envelope-level messaging client for one service
pub struct BusClient {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    registry: SharedRegistry,
    metrics: Arc<ClientMetrics>,
    codec: EnvelopeCodec,
    health: HealthReporter,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    tasks: Mutex<BackgroundTasks>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl BusClient {
    /// Validate `config` and build an unconnected client
    pub fn new(config: ClientConfig) -> BusResult<Self> {
        let registry = SubscriptionRegistry::shared();
        let metrics = Arc::new(ClientMetrics::new());
        let (connection, inbound_rx) =
            ConnectionManager::new(config.clone(), registry.clone(), metrics.clone())?;
        let connection = Arc::new(connection);

        let transport: Arc<dyn Transport> = connection.clone();
        let health = HealthReporter::new(transport, &config.client_id, config.source_name());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            codec: EnvelopeCodec::new(config.source_name()),
            health,
            config,
            connection,
            registry,
            metrics,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(BackgroundTasks::default()),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, BackgroundTasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect, waiting for the first handshake up to `connect_timeout`
    ///
    /// Broker failures inside that window are retried. On timeout
    /// [`BusError::ConnectTimeout`] is returned and a session started by this
    /// call is stopped. A session that was already reconnecting keeps
    /// retrying in the background.
    pub async fn connect(&self) -> BusResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        if self.connection.state() == ConnectionState::Connected {
            debug!(client_id = %self.config.client_id, "Already connected");
            return Ok(());
        }

        info!(
            client_id = %self.config.client_id,
            broker = %self.connection.params(),
            "Connecting to broker"
        );
        let started = self.connection.start();

        if let Err(e) = self
            .connection
            .wait_connected(self.config.connect_timeout())
            .await
        {
            if started {
                warn!(client_id = %self.config.client_id, error = %e, "Connect failed, stopping session");
                self.connection.disconnect().await;
            } else {
                warn!(
                    client_id = %self.config.client_id,
                    error = %e,
                    "Connect timed out, existing session keeps reconnecting"
                );
            }
            return Err(e);
        }

        self.spawn_background_tasks();
        info!(client_id = %self.config.client_id, "Bus client connected");
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks();

        if tasks.dispatcher.is_none() {
            let inbound = self
                .inbound_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(inbound) = inbound {
                let dispatcher = Dispatcher::new(
                    self.registry.clone(),
                    Deduplicator::new(self.config.dedupe_ttl(), self.config.dedupe_max_entries),
                    self.metrics.clone(),
                    self.shutdown_tx.subscribe(),
                );
                tasks.dispatcher = Some(tokio::spawn(dispatcher.run(inbound)));
            }
        }

        let heartbeat_running = tasks
            .heartbeat
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        if self.config.enable_heartbeat && !heartbeat_running {
            let transport: Arc<dyn Transport> = self.connection.clone();
            let monitor = HeartbeatMonitor::new(
                transport,
                &self.config.client_id,
                self.config.heartbeat_interval(),
            );
            let (stop_tx, stop_rx) = watch::channel(false);
            tasks.heartbeat = Some(HeartbeatTask {
                stop_tx,
                handle: tokio::spawn(monitor.run(stop_rx)),
            });
        }
    }

    async fn stop_heartbeat(&self) {
        let task = self.tasks().heartbeat.take();
        if let Some(mut task) = task {
            let _ = task.stop_tx.send(true);
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task.handle).await.is_err() {
                warn!("Heartbeat did not stop in time, aborting");
                task.handle.abort();
            }
        }
    }

    /// Close the broker session, keeping subscriptions for the next connect
    pub async fn disconnect(&self) {
        self.stop_heartbeat().await;
        self.connection.disconnect().await;
        info!(client_id = %self.config.client_id, "Bus client disconnected");
    }

    /// Final teardown; safe to call repeatedly or without a prior connect
    ///
    /// Publishes `ok=false, event="shutdown"` when health is enabled and the
    /// session is up, stops the background tasks within [`SHUTDOWN_GRACE`],
    /// then closes the connection.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client_id = %self.config.client_id, "Shutting down bus client");

        if self.config.enable_health && self.connection.is_connected() {
            if let Err(e) = self.health.publish(false, Some(events::SHUTDOWN), None).await {
                warn!(error = %e, "Failed to publish shutdown status");
            }
        }

        self.shutdown_tx.send_replace(true);
        let (dispatcher, heartbeat) = {
            let mut tasks = self.tasks();
            (tasks.dispatcher.take(), tasks.heartbeat.take())
        };

        let mut handles = Vec::new();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.stop_tx.send(true);
            handles.push(("heartbeat", heartbeat.handle));
        }
        if let Some(dispatcher) = dispatcher {
            handles.push(("dispatcher", dispatcher));
        }

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for (_, handle) in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            for (name, handle) in &handles {
                if !handle.is_finished() {
                    warn!(task = *name, "Background task abandoned after grace period");
                    handle.abort();
                }
            }
        }

        self.connection.disconnect().await;
        info!(client_id = %self.config.client_id, "Bus client shut down");
    }

    /// Wrap `data` in a fresh envelope and publish it at QoS 0
    pub async fn publish_event<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        event_type: &str,
        data: &T,
    ) -> BusResult<Envelope> {
        self.publish_event_with(topic, event_type, data, PublishOptions::default())
            .await
    }

    /// Wrap `data` in a fresh envelope and publish it with `options`
    ///
    /// Returns the envelope that was sent, so callers can correlate replies
    /// against its `id`. With QoS 1 this resolves only after the broker's
    /// PUBACK, or fails with [`BusError::AckTimeout`] after `ack_timeout`.
    pub async fn publish_event_with<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        event_type: &str,
        data: &T,
        options: PublishOptions,
    ) -> BusResult<Envelope> {
        let envelope = self.codec.wrap(
            event_type,
            data,
            options.correlation_id.as_deref(),
            options.seq,
        )?;
        self.publish_envelope(topic, &envelope, options.qos, options.retain)
            .await?;
        Ok(envelope)
    }

    /// Publish an already built envelope unchanged
    pub async fn publish_envelope(
        &self,
        topic: &str,
        envelope: &Envelope,
        qos: Qos,
        retain: bool,
    ) -> BusResult<()> {
        let payload = EnvelopeCodec::encode(envelope)?;
        self.connection.publish(topic, payload, qos, retain).await?;
        debug!(
            topic,
            envelope_id = %envelope.id,
            event_type = %envelope.event_type,
            "Envelope published"
        );
        Ok(())
    }

    /// Retained QoS 1 status on `system/health/{client_id}`
    pub async fn publish_health(
        &self,
        ok: bool,
        event: Option<&str>,
        error: Option<&str>,
    ) -> BusResult<Envelope> {
        self.health.publish(ok, event, error).await
    }

    /// Bind `handler` to `pattern`; replaces an existing binding in place
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EnvelopeHandler>,
        qos: Qos,
    ) -> BusResult<()> {
        self.connection.subscribe(pattern, handler, qos).await
    }

    /// Remove the binding for `pattern`
    ///
    /// Returns `false` when no such binding exists. The broker is told only
    /// while connected; otherwise the binding is simply not replayed.
    pub async fn unsubscribe(&self, pattern: &str) -> BusResult<bool> {
        self.connection.unsubscribe(pattern).await
    }

    /// True only once the handshake is done and subscriptions are replayed
    pub fn connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Current session state, including the reconnecting phases
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The underlying session, for needs the facade does not cover
    pub fn transport(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connection)
    }

    /// MQTT client id, also used in the health and keepalive topics
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// The validated configuration this client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Point-in-time copy of the counters; later activity does not change it
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether any background task is still running
    ///
    /// Covers the dispatcher, the heartbeat monitor and the session
    /// supervisor. After [`shutdown`](Self::shutdown) this is `false`.
    pub fn background_tasks_active(&self) -> bool {
        let tasks = self.tasks();
        let dispatcher = tasks
            .dispatcher
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        let heartbeat = tasks
            .heartbeat
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        dispatcher || heartbeat || self.connection.supervisor_active()
    }

    /// Connect, run `body`, and always shut down afterwards
    ///
    /// The body's result is returned as is; a connect failure is returned
    /// without running the body. Shutdown runs on both paths, so health is
    /// reported as `shutdown` even when `body` fails.
    ///
    /// ```rust,no_run
    /// use bus_core::{BusClient, BusError, ClientConfig};
    ///
    /// # tokio_test::block_on(async {
    /// let config = ClientConfig::new("mqtt://localhost:1883", "tts")?;
    /// BusClient::scoped(config, |client| async move {
    ///     client
    ///         .publish_event("tts/status", "tts.ready", &serde_json::json!({}))
    ///         .await?;
    ///     Ok::<(), BusError>(())
    /// })
    /// .await?;
    /// # Ok::<(), BusError>(())
    /// # });
    /// ```
    pub async fn scoped<F, Fut, T, E>(config: ClientConfig, body: F) -> Result<T, E>
    where
        F: FnOnce(Arc<BusClient>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BusError>,
    {
        let client = Arc::new(BusClient::new(config)?);
        let result = match client.connect().await {
            Ok(()) => body(Arc::clone(&client)).await,
            Err(e) => Err(e.into()),
        };
        client.shutdown().await;
        result
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dispatcher) = tasks.dispatcher.take() {
            dispatcher.abort();
        }
        if let Some(heartbeat) = tasks.heartbeat.take() {
            heartbeat.handle.abort();
        }
    }
}
