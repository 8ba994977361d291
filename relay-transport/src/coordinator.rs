//! Redundancy coordinator
//!
//! Owns the priority-ordered endpoint pool and the single active link.
//! Every link pushes its events into one funnel tagged with a generation
//! token; events from a superseded link are dropped, which makes failover
//! race-free without cross-task locking. The run loop multiplexes commands,
//! link events, heartbeat/health/backup-sync ticks, and the reconnect
//! backoff deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use relay_core::{
    AlertKind, AlertSeverity, Connection, ConnectionStatus, DedupeWindow, Endpoint, Envelope,
    EnvelopeKind, RelayConfig, RelayError, RelayResult, CLOSE_NORMAL,
};

use crate::adapter::{Link, LinkEvent, TransportRegistry};
use crate::backoff::Backoff;
use crate::backup::BackupPool;
use crate::clock::Clock;
use crate::manager::{RelayEvent, SharedState};
use crate::monitor::{HealthMonitor, Verdict};

/// Capacity of the generation-tagged event funnel
const FUNNEL_CAPACITY: usize = 1024;

/// Capacity of the backup inbound channel
const BACKUP_INBOUND_CAPACITY: usize = 256;

/// Control commands from the manager facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Tear down the active link (if any) and rescan from priority 1
    Reconnect,
    Shutdown,
}

struct ActiveLink {
    endpoint_id: String,
    link: Link,
    pump: JoinHandle<()>,
}

/// The single writer of the active-connection pointer
pub struct Coordinator {
    config: RelayConfig,
    registry: Arc<TransportRegistry>,
    monitor: Arc<HealthMonitor>,
    backup: Arc<BackupPool>,
    shared: Arc<SharedState>,
    events: broadcast::Sender<RelayEvent>,

    endpoints: Vec<Endpoint>,
    cursors: HashMap<String, String>,
    connections: HashMap<String, Connection>,
    active: Option<ActiveLink>,
    generation: u64,
    clock: Clock,

    link_tx: mpsc::Sender<(u64, LinkEvent)>,
    link_rx: Option<mpsc::Receiver<(u64, LinkEvent)>>,
    backup_inbound_tx: mpsc::Sender<Envelope>,
    backup_inbound_rx: Option<mpsc::Receiver<Envelope>>,

    dedupe: DedupeWindow,
    backoff: Backoff,
    backoff_deadline: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        config: RelayConfig,
        registry: Arc<TransportRegistry>,
        monitor: Arc<HealthMonitor>,
        backup: Arc<BackupPool>,
        shared: Arc<SharedState>,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::channel(FUNNEL_CAPACITY);
        let (backup_inbound_tx, backup_inbound_rx) = mpsc::channel(BACKUP_INBOUND_CAPACITY);
        let endpoints = config.sorted_endpoints();
        let connections = endpoints
            .iter()
            .map(|e| (e.id.clone(), Connection::new(&e.id)))
            .collect();
        let backoff = Backoff::initial(config.base_backoff_ms, config.max_backoff_ms);
        let dedupe = DedupeWindow::new(config.backup_max_queue_size.max(1_024));
        Self {
            config,
            registry,
            monitor,
            backup,
            shared,
            events,
            endpoints,
            cursors: HashMap::new(),
            connections,
            active: None,
            generation: 0,
            clock: Clock::start(),
            link_tx,
            link_rx: Some(link_rx),
            backup_inbound_tx,
            backup_inbound_rx: Some(backup_inbound_rx),
            dedupe,
            backoff,
            backoff_deadline: None,
        }
    }

    pub fn active_endpoint(&self) -> Option<String> {
        self.active.as_ref().map(|a| a.endpoint_id.clone())
    }

    /// Per-endpoint connection records
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.values().cloned().collect()
    }

    fn transition(&mut self, endpoint_id: &str, status: ConnectionStatus) {
        if let Some(connection) = self.connections.get_mut(endpoint_id) {
            connection.status = status;
            if status == ConnectionStatus::Connected {
                connection.retry_count = 0;
            }
        }
        self.publish_connections();
    }

    fn note_attempt_failure(&mut self, endpoint_id: &str) {
        if let Some(connection) = self.connections.get_mut(endpoint_id) {
            connection.status = ConnectionStatus::Failed;
            connection.retry_count = connection.retry_count.saturating_add(1);
        }
        self.publish_connections();
    }

    fn publish_connections(&self) {
        self.shared
            .set_connections(self.connections.values().cloned().collect());
    }

    // ------------------------------------------------------------------
    // Connection scan
    // ------------------------------------------------------------------

    /// Scan the pool in priority order, skipping `exclude`, and install
    /// the first endpoint that opens. The exclusion only covers this scan
    /// cycle; excluded endpoints rejoin on the next one.
    pub async fn connect(&mut self, exclude: &[String]) -> RelayResult<String> {
        self.monitor.record_attempt();
        for endpoint in self.endpoints.clone() {
            if exclude.iter().any(|id| id == &endpoint.id) {
                continue;
            }
            let Some(transport) = self.registry.get(endpoint.kind) else {
                warn!("[Relay] no transport registered for {:?}", endpoint.kind);
                continue;
            };
            let cursor = self.cursors.get(&endpoint.id).cloned();
            info!(
                "[Relay] trying {} (priority {})",
                endpoint.id, endpoint.priority
            );
            self.transition(&endpoint.id, ConnectionStatus::Connecting);
            match transport.open(&endpoint, cursor).await {
                Ok((link, events)) => {
                    self.install(&endpoint, link, events).await;
                    return Ok(endpoint.id.clone());
                }
                Err(e) => {
                    warn!("[Relay] {} unavailable: {}", endpoint.id, e);
                    self.note_attempt_failure(&endpoint.id);
                    if !e.is_retryable() {
                        debug!("[Relay] {} error is not per-attempt: {}", endpoint.id, e);
                    }
                }
            }
        }
        Err(RelayError::AllEndpointsExhausted)
    }

    /// Make a freshly opened link the active one and start its event pump
    async fn install(&mut self, endpoint: &Endpoint, link: Link, mut events: mpsc::Receiver<LinkEvent>) {
        if let Some(old) = self.active.take() {
            old.link.close(CLOSE_NORMAL, "superseded");
            old.pump.abort();
        }

        self.generation += 1;
        let generation = self.generation;
        let funnel = self.link_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if funnel.send((generation, event)).await.is_err() {
                    break;
                }
            }
        });

        let now = self.clock.now_ms();
        self.monitor.record_connected(now, &endpoint.id);
        self.transition(&endpoint.id, ConnectionStatus::Connected);
        self.shared.set_connected(&endpoint.id, link.sender());
        self.shared.set_last_error(None);
        self.backoff = Backoff::initial(self.config.base_backoff_ms, self.config.max_backoff_ms);
        self.backoff_deadline = None;
        self.active = Some(ActiveLink {
            endpoint_id: endpoint.id.clone(),
            link,
            pump,
        });
        info!("[Relay] active on {}", endpoint.id);
        let _ = self.events.send(RelayEvent::Connected {
            endpoint_id: endpoint.id.clone(),
        });

        if self.backup.is_active() {
            self.retire_backup().await;
        }
    }

    /// Replay the queued envelopes over the recovered link, then release
    /// the backup service
    async fn retire_backup(&mut self) {
        let queued = self.backup.drain();
        if !queued.is_empty() {
            info!("[Relay] replaying {} queued envelopes", queued.len());
            if let Some(active) = &self.active {
                let sender = active.link.sender();
                for envelope in queued {
                    // At-least-once: skip ids this session already moved
                    if !self.dedupe.insert(&envelope.id) {
                        continue;
                    }
                    if sender.send(envelope).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.backup.deactivate().await;
        self.shared.set_backup_active(false);
        let _ = self.events.send(RelayEvent::BackupDeactivated);
    }

    // ------------------------------------------------------------------
    // Failover
    // ------------------------------------------------------------------

    /// Close the active link cleanly and move to the next endpoint
    pub async fn failover(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            if self.connect(&[]).await.is_err() {
                self.on_exhausted().await;
            }
            return;
        };
        let from = active.endpoint_id.clone();
        warn!("[Relay] failing over from {}: {}", from, reason);

        // Clean 1000 closure: the peer sees an intentional hand-off
        let frame = relay_core::CloseFrame::switching();
        active.link.close(frame.code, &frame.reason);
        if let Some(cursor) = active.link.last_cursor() {
            self.cursors.insert(from.clone(), cursor);
        }
        // Late events from this link now carry a stale generation
        self.generation += 1;
        active.pump.abort();

        let now = self.clock.now_ms();
        self.monitor.record_disconnected(now);
        self.monitor.record_failover(now);
        self.transition(&from, ConnectionStatus::Failed);
        self.shared.set_disconnected();
        let _ = self.events.send(RelayEvent::FailoverStarted { from: from.clone() });

        match self.connect(std::slice::from_ref(&from)).await {
            Ok(to) => {
                let _ = self.events.send(RelayEvent::FailoverCompleted { to });
            }
            Err(_) => self.on_exhausted().await,
        }
    }

    /// The link closed underneath us (peer close or transport failure)
    async fn handle_closed(&mut self, code: u16, reason: String) {
        let Some(active) = self.active.take() else {
            return;
        };
        let from = active.endpoint_id.clone();
        if let Some(cursor) = active.link.last_cursor() {
            self.cursors.insert(from.clone(), cursor);
        }
        self.generation += 1;
        active.pump.abort();

        let now = self.clock.now_ms();
        self.monitor.record_disconnected(now);
        self.shared.set_disconnected();
        let _ = self.events.send(RelayEvent::Disconnected {
            endpoint_id: from.clone(),
            code,
            reason: reason.clone(),
        });

        let clean = code == CLOSE_NORMAL;
        if clean {
            self.transition(&from, ConnectionStatus::Disconnected);
            info!("[Relay] {} closed cleanly: {}", from, reason);
        } else {
            self.transition(&from, ConnectionStatus::Failed);
            warn!("[Relay] {} closed abnormally ({}): {}", from, code, reason);
            self.monitor.record_failover(now);
            let _ = self.events.send(RelayEvent::FailoverStarted { from: from.clone() });
        }

        match self.connect(std::slice::from_ref(&from)).await {
            Ok(to) => {
                if !clean {
                    let _ = self.events.send(RelayEvent::FailoverCompleted { to });
                }
            }
            Err(_) => self.on_exhausted().await,
        }
    }

    /// Every primary endpoint failed this cycle: go to backup and arm the
    /// reconnect backoff
    async fn on_exhausted(&mut self) {
        error!("[Relay] all endpoints exhausted");
        self.shared.set_disconnected();
        self.shared
            .set_last_error(Some(RelayError::AllEndpointsExhausted.to_string()));
        if let Some(alert) = self.monitor.raise_alert(
            AlertKind::EndpointsExhausted,
            AlertSeverity::Critical,
            "no primary endpoint reachable",
        ) {
            let _ = self.events.send(RelayEvent::AlertRaised(alert));
        }

        let was_active = self.backup.is_active();
        match self.backup.activate(self.backup_inbound_tx.clone()).await {
            Ok(service_id) => {
                self.shared.set_backup_active(true);
                if !was_active {
                    let _ = self.events.send(RelayEvent::BackupActivated { service_id });
                }
            }
            Err(e) => {
                // No primaries and no backup: the channel is failed until
                // an explicit reconnect
                error!("[Relay] backup activation failed: {}", e);
                if let Some(alert) = self.monitor.raise_alert(
                    AlertKind::BackupFailed,
                    AlertSeverity::Critical,
                    e.to_string(),
                ) {
                    let _ = self.events.send(RelayEvent::AlertRaised(alert));
                }
                self.monitor.set_channel_failed(true);
                self.shared.set_last_error(Some(e.to_string()));
                let _ = self.events.send(RelayEvent::ChannelFailed);
                self.backoff_deadline = None;
                return;
            }
        }

        if self.backoff.exhausted(self.config.max_retries) {
            warn!("[Relay] retry budget spent; staying on backup until reconnect()");
            if let Some(alert) = self.monitor.raise_alert(
                AlertKind::ConnectionLost,
                AlertSeverity::Critical,
                format!(
                    "primary recovery suspended after {} attempts",
                    self.backoff.attempt
                ),
            ) {
                let _ = self.events.send(RelayEvent::AlertRaised(alert));
            }
            self.backoff_deadline = None;
        } else {
            let delay = self.backoff.next_delay();
            info!(
                "[Relay] rescanning primaries in {:?} (attempt {})",
                delay,
                self.backoff.attempt + 1
            );
            self.backoff_deadline = Some(Instant::now() + delay);
            self.backoff = self
                .backoff
                .advance(self.config.base_backoff_ms, self.config.max_backoff_ms);
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let (Some(mut link_rx), Some(mut backup_rx)) =
            (self.link_rx.take(), self.backup_inbound_rx.take())
        else {
            return;
        };

        if self.connect(&[]).await.is_err() {
            self.on_exhausted().await;
        }

        let mut heartbeat = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut health = interval(Duration::from_millis(self.config.health_check_interval_ms));
        let mut backup_sync = interval(Duration::from_millis(self.config.backup_sync_interval_ms));
        for ticker in [&mut heartbeat, &mut health, &mut backup_sync] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate first tick
            ticker.reset();
        }

        loop {
            let backoff_deadline = self.backoff_deadline;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Reconnect) => self.handle_reconnect().await,
                    Some(Command::Shutdown) | None => {
                        self.shutdown().await;
                        return;
                    }
                },

                Some((generation, event)) = link_rx.recv() => {
                    self.handle_link_event(generation, event).await;
                },

                Some(envelope) = backup_rx.recv() => {
                    self.handle_backup_inbound(envelope);
                },

                _ = heartbeat.tick() => self.on_heartbeat_tick(),

                _ = health.tick() => self.on_health_tick().await,

                _ = backup_sync.tick() => {
                    if self.backup.is_active() {
                        self.backup.sync().await;
                    }
                },

                _ = async {
                    match backoff_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.backoff_deadline = None;
                    self.try_primary_recovery().await;
                },
            }
        }
    }

    async fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation {
            // Superseded link still draining; nothing from it counts
            return;
        }
        match event {
            LinkEvent::Message(envelope) => self.handle_message(envelope).await,
            LinkEvent::Closed { code, reason } => self.handle_closed(code, reason).await,
            LinkEvent::Error(message) => {
                self.monitor.record_error(self.clock.now_ms());
                debug!("[Relay] transport error: {}", message);
            }
        }
    }

    async fn handle_message(&mut self, envelope: Envelope) {
        let now = self.clock.now_ms();
        match envelope.kind {
            EnvelopeKind::Ping => {
                // Peer heartbeat: echo its timestamp straight back
                if let Some(active) = &self.active {
                    let pong = Envelope::pong(envelope.timestamp_ms);
                    if !active.link.send(&pong) {
                        self.monitor.record_error(now);
                    }
                }
            }
            EnvelopeKind::Pong => {
                let latency = (now - envelope.timestamp_ms).max(0) as u64;
                self.monitor.record_pong(now, latency);
                let active_id = self.active.as_ref().map(|a| a.endpoint_id.clone());
                if let Some(id) = active_id {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.record_heartbeat(chrono::Utc::now(), latency);
                    }
                    self.publish_connections();
                }
            }
            EnvelopeKind::Error => {
                self.monitor.record_error(now);
                let _ = self.events.send(RelayEvent::Message(envelope));
            }
            _ => {
                if self.dedupe.insert(&envelope.id) {
                    self.monitor.record_message();
                    let _ = self.events.send(RelayEvent::Message(envelope));
                }
            }
        }
    }

    fn handle_backup_inbound(&mut self, envelope: Envelope) {
        if envelope.is_heartbeat() {
            return;
        }
        if self.dedupe.insert(&envelope.id) {
            self.monitor.record_message();
            let _ = self.events.send(RelayEvent::Message(envelope));
        }
    }

    fn on_heartbeat_tick(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let now = self.clock.now_ms();
        let ping = Envelope::ping(now);
        if active.link.send(&ping) {
            self.monitor.record_ping(now);
        } else {
            self.monitor.record_error(now);
        }
    }

    async fn on_health_tick(&mut self) {
        let now = self.clock.now_ms();
        let (verdict, raised) = self.monitor.evaluate(now);
        for alert in raised {
            let _ = self.events.send(RelayEvent::AlertRaised(alert));
        }
        if verdict == Verdict::FailoverNeeded && self.active.is_some() {
            self.shared.set_last_error(Some(
                RelayError::HeartbeatTimeout(self.config.failover_threshold_ms).to_string(),
            ));
            if let Some(alert) = self.monitor.raise_alert(
                AlertKind::FailoverActivated,
                AlertSeverity::Warning,
                "heartbeat timeout on active connection",
            ) {
                let _ = self.events.send(RelayEvent::AlertRaised(alert));
            }
            self.failover("heartbeat timeout").await;
        }
    }

    /// Backoff deadline fired while on backup (or fully down)
    async fn try_primary_recovery(&mut self) {
        if self.active.is_some() {
            return;
        }
        info!("[Relay] backoff elapsed, rescanning primaries");
        if self.connect(&[]).await.is_err() {
            self.on_exhausted().await;
        }
    }

    /// Manual recovery; also the only exit from the failed state
    async fn handle_reconnect(&mut self) {
        info!("[Relay] manual reconnect requested");
        self.monitor.set_channel_failed(false);
        self.shared.set_last_error(None);
        self.backoff = Backoff::initial(self.config.base_backoff_ms, self.config.max_backoff_ms);
        self.backoff_deadline = None;

        if let Some(active) = self.active.take() {
            active.link.close(CLOSE_NORMAL, "reconnect requested");
            if let Some(cursor) = active.link.last_cursor() {
                self.cursors.insert(active.endpoint_id.clone(), cursor);
            }
            self.generation += 1;
            active.pump.abort();
            self.monitor.record_disconnected(self.clock.now_ms());
            self.transition(&active.endpoint_id, ConnectionStatus::Disconnected);
            self.shared.set_disconnected();
        }

        if self.connect(&[]).await.is_err() {
            self.on_exhausted().await;
        }
    }

    async fn shutdown(&mut self) {
        info!("[Relay] shutting down");
        if let Some(active) = self.active.take() {
            active.link.close(CLOSE_NORMAL, "shutdown");
            self.generation += 1;
            active.pump.abort();
            self.transition(&active.endpoint_id, ConnectionStatus::Disconnected);
        }
        if self.backup.is_active() {
            // Flush whatever is queued before releasing the service
            self.backup.sync().await;
            self.backup.deactivate().await;
        }
        self.shared.set_disconnected();
        self.shared.set_backup_active(false);
        self.monitor.record_disconnected(self.clock.now_ms());
    }
}
