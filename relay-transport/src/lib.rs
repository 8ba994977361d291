//! Resilient event-transport layer
//!
//! Moves opaque message envelopes over a single logical channel while the
//! underlying network is unreliable. A redundancy coordinator owns a
//! priority-ordered pool of transports (websocket, push-stream, polling,
//! durable store), a health monitor turns raw transport events into a
//! 0-100 score and failover decisions, and a backup queue pool keeps the
//! channel alive through durable local persistence when every endpoint is
//! down. The [`RelayManager`] facade wires the three together behind a
//! `send`/`status`/subscribe surface.

pub mod adapter;
pub mod backoff;
pub mod backup;
mod clock;
pub mod coordinator;
pub mod manager;
pub mod monitor;

pub use adapter::{Link, LinkEvent, Transport, TransportRegistry};
pub use backoff::Backoff;
pub use backup::{BackupChannel, BackupKind, BackupPool, BackupStatus, DurablePort};
pub use coordinator::{Command, Coordinator};
pub use manager::{RelayEvent, RelayManager, RelayStatus};
pub use monitor::{HealthMonitor, HealthThresholds, Verdict};
