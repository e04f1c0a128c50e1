//! Minimal in-process MQTT 5 broker
//!
//! Packets are framed with rumqttc's own `mqttbytes` codec; the broker only
//! adds routing on top: CONNECT, PUBLISH (QoS 0/1, retained store),
//! SUBSCRIBE, UNSUBSCRIBE, PINGREQ and DISCONNECT. Fault injection hooks let
//! tests refuse or drop connections and withhold SUBACKs.

use bus_core::protocol::topic_matches;
use bytes::BytesMut;
use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, Publish, SubAck, SubscribeReasonCode,
    UnsubAck, UnsubAckReason,
};
use rumqttc::v5::mqttbytes::{Error as FrameError, QoS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A PUBLISH the broker received from some client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Default)]
struct ConnectionRecord {
    subscribes: Vec<String>,
}

struct LiveClient {
    tx: mpsc::UnboundedSender<Packet>,
    subscriptions: Vec<(String, QoS)>,
    kill: Option<oneshot::Sender<()>>,
    next_packet_id: u16,
}

impl LiveClient {
    fn packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    fn deliver(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let mut publish = Publish::new(topic, qos, payload.to_vec(), None);
        publish.retain = retain;
        if qos != QoS::AtMostOnce {
            publish.pkid = self.packet_id();
        }
        let _ = self.tx.send(Packet::Publish(publish));
    }
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<ConnectionRecord>,
    live: HashMap<usize, LiveClient>,
    retained: HashMap<String, (Vec<u8>, QoS)>,
    published: Vec<BrokerPublish>,
    refuse: bool,
    withhold_subacks: bool,
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: SharedState,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: SharedState = Arc::default();

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if lock(&accept_state).refuse {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    /// Connections accepted so far, including closed ones
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn live_connections(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Filters subscribed on the `index`th connection, in arrival order
    pub fn subscribe_requests(&self, index: usize) -> Vec<String> {
        lock(&self.state)
            .connections
            .get(index)
            .map(|record| record.subscribes.clone())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<BrokerPublish> {
        lock(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BrokerPublish> {
        self.published()
            .into_iter()
            .filter(|publish| publish.topic == topic)
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .retained
            .get(topic)
            .map(|(payload, _)| payload.clone())
    }

    /// Close new connections right after accepting them
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Record SUBSCRIBE requests but never acknowledge or honour them
    pub fn withhold_subacks(&self, withhold: bool) {
        lock(&self.state).withhold_subacks = withhold;
    }

    /// Abruptly close every live connection
    pub fn drop_all_connections(&self) {
        let mut state = lock(&self.state);
        for client in state.live.values_mut() {
            if let Some(kill) = client.kill.take() {
                let _ = kill.send(());
            }
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_all_connections();
    }
}

async fn serve(stream: TcpStream, state: SharedState) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let (kill_tx, mut kill_rx) = oneshot::channel();

    let id = {
        let mut guard = lock(&state);
        let id = guard.connections.len();
        guard.connections.push(ConnectionRecord::default());
        guard.live.insert(
            id,
            LiveClient {
                tx: tx.clone(),
                subscriptions: Vec::new(),
                kill: Some(kill_tx),
                next_packet_id: 0,
            },
        );
        id
    };

    let writer_task = tokio::spawn(async move {
        let mut buffer = BytesMut::new();
        while let Some(packet) = rx.recv().await {
            buffer.clear();
            if packet.write(&mut buffer).is_err() || writer.write_all(&buffer).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        let packet = tokio::select! {
            _ = &mut kill_rx => break,
            packet = next_packet(&mut reader, &mut buffer) => packet,
        };
        let Some(packet) = packet else {
            break;
        };
        if handle_packet(id, packet, &state, &tx).is_none() {
            break;
        }
    }

    lock(&state).live.remove(&id);
    writer_task.abort();
}

/// `None` on EOF, I/O failure or a frame the codec rejects
async fn next_packet(reader: &mut OwnedReadHalf, buffer: &mut BytesMut) -> Option<Packet> {
    loop {
        match Packet::read(buffer, None) {
            Ok(packet) => return Some(packet),
            Err(FrameError::InsufficientBytes(_)) => {}
            // Includes the zero-length DISCONNECT, which ends the session anyway
            Err(_) => return None,
        }
        if reader.read_buf(buffer).await.ok()? == 0 {
            return None;
        }
    }
}

// QoS is only PartialOrd
fn lower(a: QoS, b: QoS) -> QoS {
    if a < b {
        a
    } else {
        b
    }
}

/// `None` closes the connection
fn handle_packet(
    id: usize,
    packet: Packet,
    state: &SharedState,
    tx: &mpsc::UnboundedSender<Packet>,
) -> Option<()> {
    match packet {
        Packet::Connect(..) => {
            let _ = tx.send(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
                properties: None,
            }));
        }
        Packet::Publish(publish) => handle_publish(publish, state, tx),
        Packet::Subscribe(subscribe) => {
            let filters = subscribe
                .filters
                .into_iter()
                .map(|filter| (filter.path, lower(filter.qos, QoS::AtLeastOnce)))
                .collect();
            handle_subscribe(id, subscribe.pkid, filters, state, tx)?;
        }
        Packet::Unsubscribe(unsubscribe) => {
            if let Some(client) = lock(state).live.get_mut(&id) {
                client
                    .subscriptions
                    .retain(|(existing, _)| !unsubscribe.filters.contains(existing));
            }
            let _ = tx.send(Packet::UnsubAck(UnsubAck {
                pkid: unsubscribe.pkid,
                reasons: vec![UnsubAckReason::Success; unsubscribe.filters.len()],
                properties: None,
            }));
        }
        Packet::PingReq(_) => {
            let _ = tx.send(Packet::PingResp(PingResp));
        }
        Packet::Disconnect(_) => return None,
        _ => {}
    }
    Some(())
}

fn handle_publish(publish: Publish, state: &SharedState, tx: &mpsc::UnboundedSender<Packet>) {
    let topic = String::from_utf8_lossy(&publish.topic).into_owned();
    let payload = publish.payload.to_vec();

    let mut guard = lock(state);
    guard.published.push(BrokerPublish {
        topic: topic.clone(),
        payload: payload.clone(),
        qos: publish.qos as u8,
        retain: publish.retain,
    });
    if publish.retain {
        if payload.is_empty() {
            guard.retained.remove(&topic);
        } else {
            guard.retained.insert(topic.clone(), (payload.clone(), publish.qos));
        }
    }

    for client in guard.live.values_mut() {
        let granted = client
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &topic))
            .map(|(_, sub_qos)| *sub_qos)
            .reduce(|a, b| if b > a { b } else { a });
        if let Some(sub_qos) = granted {
            let delivered = lower(publish.qos, sub_qos);
            client.deliver(&topic, &payload, delivered, false);
        }
    }
    drop(guard);

    // Acknowledge only once the message is visible to test assertions
    if publish.qos != QoS::AtMostOnce {
        let _ = tx.send(Packet::PubAck(PubAck::new(publish.pkid, None)));
    }
}

fn handle_subscribe(
    id: usize,
    pkid: u16,
    filters: Vec<(String, QoS)>,
    state: &SharedState,
    tx: &mpsc::UnboundedSender<Packet>,
) -> Option<()> {
    let mut guard = lock(state);
    if let Some(record) = guard.connections.get_mut(id) {
        record
            .subscribes
            .extend(filters.iter().map(|(filter, _)| filter.clone()));
    }
    if guard.withhold_subacks {
        return Some(());
    }

    let retained: Vec<(String, Vec<u8>, QoS)> = guard
        .retained
        .iter()
        .map(|(topic, (payload, qos))| (topic.clone(), payload.clone(), *qos))
        .collect();

    let client = guard.live.get_mut(&id)?;
    for (filter, qos) in &filters {
        client.subscriptions.retain(|(existing, _)| existing != filter);
        client.subscriptions.push((filter.clone(), *qos));
    }

    let _ = tx.send(Packet::SubAck(SubAck {
        pkid,
        return_codes: filters
            .iter()
            .map(|(_, qos)| SubscribeReasonCode::Success(*qos))
            .collect(),
        properties: None,
    }));

    for (filter, sub_qos) in &filters {
        for (topic, payload, qos) in &retained {
            if topic_matches(filter, topic) {
                let delivered = lower(*qos, *sub_qos);
                client.deliver(topic, payload, delivered, true);
            }
        }
    }
    Some(())
}
