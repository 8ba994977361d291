//! Per-endpoint runtime connection records and close-code semantics

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Standard clean-closure code: intentional hand-off, not a failure
pub const CLOSE_NORMAL: u16 = 1000;

/// Abnormal closure: the peer vanished without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Runtime status of one attempt/session against an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Mutable per-endpoint runtime record
///
/// Exactly one connection may be active at a time; the coordinator is the
/// only writer of the active pointer.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub endpoint_id: String,
    pub status: ConnectionStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub retry_count: u32,
}

impl Connection {
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            status: ConnectionStatus::Disconnected,
            last_heartbeat_at: None,
            latency_ms: None,
            retry_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Record a completed heartbeat round trip
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>, latency_ms: u64) {
        self.last_heartbeat_at = Some(at);
        self.latency_ms = Some(latency_ms);
    }
}

/// Close code plus human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Clean closure used when intentionally switching transports
    pub fn switching() -> Self {
        Self::new(CLOSE_NORMAL, "switching to backup")
    }

    /// Clean (1000) vs abnormal (non-1000) closure semantics
    pub fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}
