//! Wire envelope exchanged over every transport kind
//!
//! The relay is domain-agnostic: payloads are opaque JSON. The envelope
//! carries the message kind, a sender-assigned id used for de-duplication
//! during replay, and an epoch-millis timestamp used for heartbeat latency.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds carried over the logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Market/trading event destined for consumers
    Event,
    /// State snapshot (e.g. replayed after reconnect)
    State,
    /// Heartbeat request
    Ping,
    /// Heartbeat response, echoes the ping timestamp
    Pong,
    /// Transport-level error report
    Error,
}

/// The uniform message wrapper exchanged over any transport kind
///
/// Wire format:
/// `{"kind":"event","payload":...,"timestampMs":1712000000000,"id":"..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    pub id: String,
}

impl Envelope {
    /// Create an envelope with a freshly assigned id
    pub fn new(kind: EnvelopeKind, payload: Value, timestamp_ms: i64) -> Self {
        Self {
            kind,
            payload,
            timestamp_ms,
            id: generate_id(timestamp_ms),
        }
    }

    /// Event envelope carrying an opaque payload
    pub fn event(payload: Value, timestamp_ms: i64) -> Self {
        Self::new(EnvelopeKind::Event, payload, timestamp_ms)
    }

    /// State envelope carrying an opaque payload
    pub fn state(payload: Value, timestamp_ms: i64) -> Self {
        Self::new(EnvelopeKind::State, payload, timestamp_ms)
    }

    /// Heartbeat ping stamped with the send time
    pub fn ping(timestamp_ms: i64) -> Self {
        Self::new(EnvelopeKind::Ping, Value::Null, timestamp_ms)
    }

    /// Heartbeat pong echoing the ping timestamp for latency computation
    pub fn pong(ping_timestamp_ms: i64) -> Self {
        Self::new(EnvelopeKind::Pong, Value::Null, ping_timestamp_ms)
    }

    /// Parse an envelope from its JSON wire form
    pub fn from_json(text: &str) -> Result<Self, crate::RelayError> {
        serde_json::from_str(text).map_err(|e| crate::RelayError::malformed(e.to_string()))
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> String {
        // Envelope fields serialize infallibly
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether this envelope participates in the heartbeat round trip
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Ping | EnvelopeKind::Pong)
    }
}

/// Generate a sender-assigned envelope id: epoch millis plus a random suffix
fn generate_id(timestamp_ms: i64) -> String {
    format!("{}-{:08x}", timestamp_ms, rand::random::<u32>())
}

// ============================================================================
// Replay de-duplication
// ============================================================================

/// Bounded window of recently seen envelope ids
///
/// Backup replay is at-least-once; consumers discard duplicates by id.
/// The window is FIFO-bounded so memory stays flat across long outages.
#[derive(Debug)]
pub struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record an id; returns `false` if it was already in the window
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
