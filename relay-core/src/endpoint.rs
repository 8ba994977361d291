//! Endpoint configuration for the transport pool

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport kind behind an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Persistent duplex socket
    WebSocket,
    /// Server-push stream (SSE)
    PushStream,
    /// Interval-poll HTTP
    Poll,
    /// Durable local store
    Durable,
}

impl EndpointKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            EndpointKind::WebSocket => "websocket",
            EndpointKind::PushStream => "push-stream",
            EndpointKind::Poll => "poll",
            EndpointKind::Durable => "durable",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A statically configured remote address plus priority rank
///
/// Immutable after load. Priority is a total order: 1 is the most
/// preferred endpoint, secondaries are 2 and up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub address: String,
    pub kind: EndpointKind,
    pub priority: u8,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        kind: EndpointKind,
        priority: u8,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            kind,
            priority,
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ascending priority, id as a stable tiebreaker
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_sort_by_ascending_priority() {
        let mut pool = vec![
            Endpoint::new("c", "wss://c", EndpointKind::WebSocket, 3),
            Endpoint::new("a", "wss://a", EndpointKind::WebSocket, 1),
            Endpoint::new("b", "https://b", EndpointKind::Poll, 2),
        ];
        pool.sort();
        let ids: Vec<&str> = pool.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn kind_round_trips_through_serde() {
        let json = serde_json::to_string(&EndpointKind::PushStream).unwrap();
        assert_eq!(json, "\"push_stream\"");
        let back: EndpointKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EndpointKind::PushStream);
    }
}
