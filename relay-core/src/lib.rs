//! Core types for the resilient market-event relay
//!
//! This crate defines the shared data structures used across the relay:
//! the wire envelope, endpoint configuration, connection records, health
//! snapshots, alerts, and the relay-wide error type.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod health;

pub use config::{BackupChannels, RelayConfig};
pub use connection::{CloseFrame, Connection, ConnectionStatus, CLOSE_NORMAL};
pub use endpoint::{Endpoint, EndpointKind};
pub use envelope::{DedupeWindow, Envelope, EnvelopeKind};
pub use error::{RelayError, RelayResult};
pub use health::{Alert, AlertKind, AlertSeverity, HealthSnapshot, HealthStatus};

/// Current wall-clock time in epoch milliseconds.
///
/// Envelope timestamps and heartbeat correlation all use epoch millis so
/// latency is a plain subtraction on both ends of the wire.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
