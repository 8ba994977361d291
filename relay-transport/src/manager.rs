//! Manager facade
//!
//! The single entry point consumers hold. Construction wires the
//! coordinator, health monitor and backup pool together and spawns the run
//! loop; afterwards the surface is a synchronous non-throwing `send`, a
//! derived `status`, a broadcast subscription for channel events, and an
//! idempotent async `destroy`. Dropping the subscription receiver is the
//! unsubscribe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use relay_core::{Alert, Connection, Envelope, HealthSnapshot, RelayConfig, RelayResult};

use crate::adapter::TransportRegistry;
use crate::backup::BackupPool;
use crate::clock::Clock;
use crate::coordinator::{Command, Coordinator};
use crate::monitor::{HealthMonitor, HealthThresholds};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Channel lifecycle events published to subscribers
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected {
        endpoint_id: String,
    },
    Disconnected {
        endpoint_id: String,
        code: u16,
        reason: String,
    },
    FailoverStarted {
        from: String,
    },
    FailoverCompleted {
        to: String,
    },
    BackupActivated {
        service_id: String,
    },
    BackupDeactivated,
    /// Inbound envelope, de-duplicated
    Message(Envelope),
    AlertRaised(Alert),
    /// Terminal until an explicit `reconnect`
    ChannelFailed,
}

/// Point-in-time view of the logical channel
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub is_connected: bool,
    pub active_connection_id: Option<String>,
    pub health_score: u8,
    pub backup_active: bool,
    pub last_error: Option<String>,
    pub uptime_ms: u64,
    pub message_count: u64,
    pub failover_count: u64,
}

/// State shared between the coordinator task and the synchronous facade
/// methods; the coordinator is the only writer
pub struct SharedState {
    connected: AtomicBool,
    backup_active: AtomicBool,
    active_endpoint: RwLock<Option<String>>,
    active_sender: RwLock<Option<mpsc::Sender<Envelope>>>,
    last_error: RwLock<Option<String>>,
    connections: RwLock<Vec<Connection>>,
    started_at_ms: i64,
}

impl SharedState {
    pub fn new(now_ms: i64) -> Self {
        Self {
            connected: AtomicBool::new(false),
            backup_active: AtomicBool::new(false),
            active_endpoint: RwLock::new(None),
            active_sender: RwLock::new(None),
            last_error: RwLock::new(None),
            connections: RwLock::new(Vec::new()),
            started_at_ms: now_ms,
        }
    }

    pub fn set_connected(&self, endpoint_id: &str, sender: mpsc::Sender<Envelope>) {
        *self.active_endpoint.write() = Some(endpoint_id.to_string());
        *self.active_sender.write() = Some(sender);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn set_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.active_endpoint.write() = None;
        *self.active_sender.write() = None;
    }

    pub fn set_backup_active(&self, active: bool) {
        self.backup_active.store(active, Ordering::SeqCst);
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write() = error;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn backup_active(&self) -> bool {
        self.backup_active.load(Ordering::SeqCst)
    }

    pub fn active_endpoint(&self) -> Option<String> {
        self.active_endpoint.read().clone()
    }

    pub fn sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.active_sender.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn set_connections(&self, connections: Vec<Connection>) {
        *self.connections.write() = connections;
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.read().clone()
    }

    pub fn uptime_ms(&self, now_ms: i64) -> u64 {
        (now_ms - self.started_at_ms).max(0) as u64
    }
}

/// Facade over the coordinator, monitor and backup pool
pub struct RelayManager {
    shared: Arc<SharedState>,
    monitor: Arc<HealthMonitor>,
    backup: Arc<BackupPool>,
    events: broadcast::Sender<RelayEvent>,
    cmd_tx: mpsc::Sender<Command>,
    runner: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    clock: Clock,
}

impl RelayManager {
    /// Build the relay with the production transports and start it
    pub fn initialize(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;
        let registry = TransportRegistry::standard(&config);
        Self::with_registry(config, registry)
    }

    /// Build with an injected transport registry (tests register mocks)
    pub fn with_registry(config: RelayConfig, registry: TransportRegistry) -> RelayResult<Self> {
        config.validate()?;
        let clock = Clock::start();
        let now = clock.now_ms();
        let shared = Arc::new(SharedState::new(now));
        let monitor = Arc::new(HealthMonitor::new(
            HealthThresholds::default(),
            config.failover_threshold_ms,
            now,
        ));
        let backup = Arc::new(BackupPool::from_config(&config)?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let coordinator = Coordinator::new(
            config,
            Arc::new(registry),
            Arc::clone(&monitor),
            Arc::clone(&backup),
            Arc::clone(&shared),
            events.clone(),
        );
        let runner = tokio::spawn(coordinator.run(cmd_rx));
        info!("[Relay] manager initialized");

        Ok(Self {
            shared,
            monitor,
            backup,
            events,
            cmd_tx,
            runner: Mutex::new(Some(runner)),
            destroyed: AtomicBool::new(false),
            clock,
        })
    }

    /// Queue an envelope for transmission. Never throws: `true` means the
    /// envelope was accepted by the active link or the backup queue,
    /// `false` that no path exists (envelope dropped).
    pub fn send(&self, envelope: Envelope) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let envelope = match self.shared.sender() {
            Some(sender) => match sender.try_send(envelope) {
                Ok(()) => return true,
                Err(err) => err.into_inner(),
            },
            None => envelope,
        };
        self.backup.enqueue(envelope)
    }

    /// Derived point-in-time status; cheap enough to poll
    pub fn status(&self) -> RelayStatus {
        let now = self.clock.now_ms();
        let snapshot = self.monitor.snapshot(now);
        RelayStatus {
            is_connected: self.shared.is_connected(),
            active_connection_id: self.shared.active_endpoint(),
            health_score: snapshot.score,
            backup_active: self.shared.backup_active(),
            last_error: self.shared.last_error(),
            uptime_ms: self.shared.uptime_ms(now),
            message_count: snapshot.message_count,
            failover_count: snapshot.failover_count,
        }
    }

    /// Health snapshot; `None` until the first connection attempt begins
    pub fn health_metrics(&self) -> Option<HealthSnapshot> {
        self.monitor
            .observed()
            .then(|| self.monitor.snapshot(self.clock.now_ms()))
    }

    /// Per-endpoint connection records (status, retries, last heartbeat)
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.monitor.active_alerts()
    }

    /// Acknowledge an alert; `false` for unknown or already-resolved ids
    pub fn resolve_alert(&self, id: u64) -> bool {
        self.monitor.resolve_alert(id)
    }

    /// Subscribe to channel events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Request a manual reconnect from priority 1; also the only exit
    /// from the failed state. `false` once destroyed.
    pub fn reconnect(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.cmd_tx.try_send(Command::Reconnect).is_ok()
    }

    pub fn backup_queue_len(&self) -> usize {
        self.backup.queue_len()
    }

    /// Tear everything down: close the active link, flush and release the
    /// backup service, stop the run loop. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let runner = self.runner.lock().take();
        if let Some(handle) = runner {
            let _ = handle.await;
        }
        info!("[Relay] manager destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_state_tracks_the_active_link() {
        let shared = SharedState::new(0);
        assert!(!shared.is_connected());
        assert!(shared.sender().is_none());

        let (tx, _rx) = mpsc::channel(1);
        shared.set_connected("primary", tx);
        assert!(shared.is_connected());
        assert_eq!(shared.active_endpoint().as_deref(), Some("primary"));
        assert!(shared.sender().is_some());

        shared.set_disconnected();
        assert!(!shared.is_connected());
        assert!(shared.active_endpoint().is_none());
        assert!(shared.sender().is_none());
    }

    #[test]
    fn uptime_never_goes_negative() {
        let shared = SharedState::new(1_000);
        assert_eq!(shared.uptime_ms(500), 0);
        assert_eq!(shared.uptime_ms(2_500), 1_500);
    }
}
