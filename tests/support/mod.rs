//! Shared helpers for integration tests
#![allow(dead_code)]

pub mod fake_broker;

use bus_core::ClientConfig;
use std::time::Duration;

pub use fake_broker::FakeBroker;

/// Fast timings so reconnect scenarios finish quickly
pub fn test_config(broker: &FakeBroker, client_id: &str) -> ClientConfig {
    ClientConfig::new(broker.url(), client_id)
        .unwrap()
        .with_reconnect_delays(Duration::from_millis(50), Duration::from_millis(200))
        .with_connect_timeout(Duration::from_secs(5))
        .with_ack_timeout(Duration::from_secs(2))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
