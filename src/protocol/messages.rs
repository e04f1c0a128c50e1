//! System payloads: lifecycle health status and periodic heartbeat

use serde::{Deserialize, Serialize};

/// Envelope type used for health status publications
pub const HEALTH_EVENT_TYPE: &str = "system.health";

/// Well-known lifecycle labels
pub mod events {
    pub const READY: &str = "ready";
    pub const RECONNECTED: &str = "reconnected";
    pub const SHUTDOWN: &str = "shutdown";
    pub const OFFLINE: &str = "offline";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Lifecycle transition status published retained on the health topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn new(ok: bool, event: Option<&str>, error: Option<&str>) -> Self {
        Self {
            ok,
            event: event.map(str::to_string),
            error: error.map(str::to_string),
        }
    }

    pub fn event(ok: bool, event: &str) -> Self {
        Self::new(ok, Some(event), None)
    }

    pub fn failure(error: &str) -> Self {
        Self::new(false, None, Some(error))
    }
}

/// Periodic liveness payload, never retained and not enveloped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ok: bool,
    pub event: String,
    pub ts: f64,
}

impl HeartbeatPayload {
    pub fn now() -> Self {
        Self {
            ok: true,
            event: events::HEARTBEAT.to_string(),
            ts: super::envelope::now_epoch_secs(),
        }
    }
}
