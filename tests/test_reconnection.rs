//! Session recovery: reconnect, resubscribe, resume dispatch

mod support;

use bus_core::protocol::EnvelopeCodec;
use bus_core::testing::RecordingHandler;
use bus_core::transport::Transport;
use bus_core::{BusClient, BusError, ConnectionState, Qos};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{eventually, test_config, FakeBroker};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_drop() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "resilient")).unwrap();
    client.connect().await.unwrap();

    let voice = Arc::new(RecordingHandler::new());
    let wake = Arc::new(RecordingHandler::new());
    client.subscribe("voice/#", voice.clone(), Qos::AtLeastOnce).await.unwrap();
    client.subscribe("wake/+", wake.clone(), Qos::AtMostOnce).await.unwrap();

    broker.drop_all_connections();

    // Backoff tops out at 200ms in the test config
    let recovered = eventually(WAIT, || {
        broker.connection_count() == 2 && client.connected()
    })
    .await;
    assert!(recovered);

    // Registration order, each exactly once
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        broker.subscribe_requests(1),
        vec!["voice/#".to_string(), "wake/+".to_string()]
    );

    client
        .publish_event("voice/transcript", "stt.final", &json!({"text": "back"}))
        .await
        .unwrap();
    client
        .publish_event("wake/detected", "wake.detected", &json!({"word": "hey"}))
        .await
        .unwrap();
    assert!(voice.wait_for(1, WAIT).await);
    assert!(wake.wait_for(1, WAIT).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_publishes_health_and_counts() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "counted")).unwrap();
    client.connect().await.unwrap();

    broker.drop_all_connections();
    assert!(eventually(WAIT, || broker.connection_count() == 2 && client.connected()).await);

    let reconnected = eventually(WAIT, || {
        broker
            .published_on("system/health/counted")
            .iter()
            .filter_map(|publish| EnvelopeCodec::decode(&publish.payload).ok())
            .any(|envelope| envelope.data.get("event") == Some(&json!("reconnected")))
    })
    .await;
    assert!(reconnected);
    assert_eq!(client.metrics().reconnects, 1);

    let status = broker.published_on("system/health/counted");
    assert!(status.iter().all(|publish| publish.retain && publish.qos == 1));

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_during_outage_is_replayed_once() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "outage")).unwrap();
    client.connect().await.unwrap();
    let early = Arc::new(RecordingHandler::new());
    client.subscribe("early/#", early.clone(), Qos::AtMostOnce).await.unwrap();

    broker.refuse_connections(true);
    broker.drop_all_connections();
    let reconnecting = eventually(WAIT, || {
        matches!(client.connection_state(), ConnectionState::Reconnecting(_))
    })
    .await;
    assert!(reconnecting);

    // Publishing is refused, subscribing is deferred
    let publish = client.publish_event("early/x", "test.event", &json!({})).await;
    assert!(matches!(publish, Err(BusError::NotConnected { .. })));

    let late = Arc::new(RecordingHandler::new());
    client.subscribe("late/#", late.clone(), Qos::AtLeastOnce).await.unwrap();

    broker.refuse_connections(false);
    assert!(eventually(WAIT, || client.connected()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        broker.subscribe_requests(1),
        vec!["early/#".to_string(), "late/#".to_string()]
    );

    client.publish_event("late/news", "test.event", &json!({"n": 1})).await.unwrap();
    assert!(late.wait_for(1, WAIT).await);
    assert_eq!(early.count(), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_repeated_drops_never_duplicate_subscriptions() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "flappy")).unwrap();
    client.connect().await.unwrap();
    let handler = Arc::new(RecordingHandler::new());
    client.subscribe("flap/#", handler.clone(), Qos::AtLeastOnce).await.unwrap();

    for round in 1..=3 {
        broker.drop_all_connections();
        let back = eventually(WAIT, || broker.connection_count() == round + 1 && client.connected()).await;
        assert!(back, "round {round} did not recover");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for connection in 0..4 {
        assert_eq!(broker.subscribe_requests(connection), vec!["flap/#".to_string()]);
    }

    client.publish_event("flap/1", "test.event", &json!({})).await.unwrap();
    assert!(handler.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.count(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_forced_reconnect_replaces_session() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "forced")).unwrap();
    client.connect().await.unwrap();
    let handler = Arc::new(RecordingHandler::new());
    client.subscribe("forced/#", handler.clone(), Qos::AtMostOnce).await.unwrap();

    client.transport().request_reconnect("test");

    assert!(eventually(WAIT, || broker.connection_count() == 2 && client.connected()).await);
    assert!(eventually(WAIT, || broker.live_connections() == 1).await);

    client.publish_event("forced/1", "test.event", &json!({})).await.unwrap();
    assert!(handler.wait_for(1, WAIT).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_outage_is_clean() {
    let broker = FakeBroker::start().await;
    let client = BusClient::new(test_config(&broker, "mid-outage")).unwrap();
    client.connect().await.unwrap();

    broker.refuse_connections(true);
    broker.drop_all_connections();
    assert!(
        eventually(WAIT, || {
            matches!(client.connection_state(), ConnectionState::Reconnecting(_))
        })
        .await
    );

    client.shutdown().await;
    assert!(!client.background_tasks_active());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_timeout_during_outage_keeps_session_alive() {
    let broker = FakeBroker::start().await;
    let config =
        test_config(&broker, "impatient").with_connect_timeout(Duration::from_millis(300));
    let client = BusClient::new(config).unwrap();
    client.connect().await.unwrap();
    let handler = Arc::new(RecordingHandler::new());
    client.subscribe("after/#", handler.clone(), Qos::AtLeastOnce).await.unwrap();

    broker.refuse_connections(true);
    broker.drop_all_connections();
    assert!(
        eventually(WAIT, || {
            matches!(client.connection_state(), ConnectionState::Reconnecting(_))
        })
        .await
    );

    let again = client.connect().await;
    assert!(matches!(again, Err(BusError::ConnectTimeout { timeout_ms: 300 })));
    // The timed out call must not have torn down the running session
    assert!(client.transport().supervisor_active());
    assert_ne!(client.connection_state(), ConnectionState::Disconnected);

    broker.refuse_connections(false);
    assert!(eventually(WAIT, || client.connected()).await);

    client.publish_event("after/outage", "test.event", &json!({})).await.unwrap();
    assert!(handler.wait_for(1, WAIT).await);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unacknowledged_subscribe_is_not_replayed() {
    let broker = FakeBroker::start().await;
    let config = test_config(&broker, "unacked").with_ack_timeout(Duration::from_millis(300));
    let client = BusClient::new(config).unwrap();
    client.connect().await.unwrap();

    broker.withhold_subacks(true);
    let ignored = Arc::new(RecordingHandler::new());
    let result = client
        .subscribe("ignored/#", ignored.clone(), Qos::AtLeastOnce)
        .await;
    assert!(matches!(result, Err(BusError::AckTimeout { .. })));
    assert_eq!(broker.subscribe_requests(0), vec!["ignored/#".to_string()]);

    broker.withhold_subacks(false);
    let kept = Arc::new(RecordingHandler::new());
    client.subscribe("kept/#", kept.clone(), Qos::AtLeastOnce).await.unwrap();

    broker.drop_all_connections();
    assert!(eventually(WAIT, || broker.connection_count() == 2 && client.connected()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.subscribe_requests(1), vec!["kept/#".to_string()]);

    client.publish_event("ignored/x", "test.event", &json!({})).await.unwrap();
    client.publish_event("kept/x", "test.event", &json!({})).await.unwrap();
    assert!(kept.wait_for(1, WAIT).await);
    assert_eq!(ignored.count(), 0);

    client.shutdown().await;
}
