//! Backup queue pool
//!
//! When the coordinator reports every primary endpoint exhausted, the pool
//! keeps the logical channel alive over lower-fidelity channels, in
//! priority order: server-push stream, interval polling, then the two
//! durable local stores (flat log, then the indexed store). Messages are
//! buffered in a bounded FIFO queue and replayed at-least-once; consumers
//! discard duplicates by envelope id.

pub mod channel;
pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relay_core::{Envelope, RelayConfig, RelayError, RelayResult};

pub use channel::{PollBackup, PushStreamBackup};
pub use store::{DurablePort, FlatLogPort, SqlitePort};

/// Backup channel kinds, in activation priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    PushStream,
    Poll,
    DurableLog,
    DurableIndexed,
}

/// Lifecycle status of one backup service
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Active,
    Standby,
    Failed,
}

/// One fallback channel the pool can activate
#[async_trait]
pub trait BackupChannel: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> BackupKind;

    /// Activation check. Network kinds succeed only once the remote side
    /// has acknowledged a request; durable kinds once the storage handle
    /// is confirmed writable.
    async fn probe(&self) -> RelayResult<()>;

    /// Push a batch out (or down to storage); returns how many envelopes
    /// may be pruned from the in-memory queue
    async fn deliver(&self, batch: &[Envelope]) -> RelayResult<usize>;

    /// Envelopes persisted by an earlier session, oldest first
    async fn recover(&self) -> RelayResult<Vec<Envelope>> {
        Ok(Vec::new())
    }

    /// Start the inbound listener, if this kind has one
    fn spawn_listener(&self, _inbound: mpsc::Sender<Envelope>) -> Option<JoinHandle<()>> {
        None
    }

    async fn shutdown(&self) {}
}

/// Durable-store channel over a [`DurablePort`]
pub struct DurableBackup {
    id: String,
    kind: BackupKind,
    port: Box<dyn DurablePort>,
    recover_limit: usize,
}

impl DurableBackup {
    pub fn new(
        id: impl Into<String>,
        kind: BackupKind,
        port: Box<dyn DurablePort>,
        recover_limit: usize,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            port,
            recover_limit,
        }
    }
}

#[async_trait]
impl BackupChannel for DurableBackup {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackupKind {
        self.kind
    }

    async fn probe(&self) -> RelayResult<()> {
        self.port.flush()
    }

    async fn deliver(&self, batch: &[Envelope]) -> RelayResult<usize> {
        for envelope in batch {
            self.port.put(envelope)?;
        }
        self.port.flush()?;
        Ok(batch.len())
    }

    async fn recover(&self) -> RelayResult<Vec<Envelope>> {
        self.port.get(self.recover_limit)
    }
}

struct BackupSlot {
    priority: u8,
    status: RwLock<BackupStatus>,
    channel: Arc<dyn BackupChannel>,
}

/// Priority-ordered pool of fallback channels with a bounded replay queue
pub struct BackupPool {
    slots: Vec<BackupSlot>,
    active: RwLock<Option<usize>>,
    queue: Mutex<VecDeque<Envelope>>,
    max_queue: usize,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BackupPool {
    /// Pool from explicit channels (tests inject mocks this way)
    pub fn new(channels: Vec<(u8, Arc<dyn BackupChannel>)>, max_queue: usize) -> Self {
        let mut slots: Vec<BackupSlot> = channels
            .into_iter()
            .map(|(priority, channel)| BackupSlot {
                priority,
                status: RwLock::new(BackupStatus::Standby),
                channel,
            })
            .collect();
        slots.sort_by_key(|s| s.priority);
        Self {
            slots,
            active: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            max_queue: max_queue.max(1),
            last_sync_at: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Build the configured channel set: push-stream, poll, flat log,
    /// indexed store, in that priority order
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        let mut channels: Vec<(u8, Arc<dyn BackupChannel>)> = Vec::new();

        if let Some(ref address) = config.backup.push_stream_address {
            channels.push((1, Arc::new(PushStreamBackup::new("backup-push", address))));
        }
        if let Some(ref address) = config.backup.poll_address {
            channels.push((
                2,
                Arc::new(PollBackup::new(
                    "backup-poll",
                    address,
                    config.backup_sync_interval_ms,
                )),
            ));
        }
        if let Some(ref path) = config.backup.flat_log_path {
            let port = FlatLogPort::new(path.clone(), config.backup_max_queue_size)?;
            channels.push((
                3,
                Arc::new(DurableBackup::new(
                    "backup-log",
                    BackupKind::DurableLog,
                    Box::new(port),
                    config.backup_max_queue_size,
                )),
            ));
        }
        if let Some(ref path) = config.backup.sqlite_path {
            let port = SqlitePort::new(path)?;
            channels.push((
                4,
                Arc::new(DurableBackup::new(
                    "backup-db",
                    BackupKind::DurableIndexed,
                    Box::new(port),
                    config.backup_max_queue_size,
                )),
            ));
        }

        Ok(Self::new(channels, config.backup_max_queue_size))
    }

    /// Activate the first channel whose probe succeeds; the rest stay on
    /// standby. Persisted envelopes from earlier sessions are recovered
    /// into the replay queue.
    pub async fn activate(&self, inbound: mpsc::Sender<Envelope>) -> RelayResult<String> {
        if let Some(idx) = *self.active.read() {
            return Ok(self.slots[idx].channel.id().to_string());
        }

        let mut reasons = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            match slot.channel.probe().await {
                Ok(()) => {
                    *slot.status.write() = BackupStatus::Active;
                    *self.active.write() = Some(idx);

                    match slot.channel.recover().await {
                        Ok(persisted) if !persisted.is_empty() => {
                            info!(
                                "[Backup] recovered {} persisted envelopes from {}",
                                persisted.len(),
                                slot.channel.id()
                            );
                            let mut queue = self.queue.lock();
                            for envelope in persisted {
                                if queue.iter().any(|e| e.id == envelope.id) {
                                    continue;
                                }
                                if queue.len() == self.max_queue {
                                    queue.pop_front();
                                }
                                queue.push_back(envelope);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("[Backup] recovery failed on {}: {}", slot.channel.id(), e),
                    }

                    if let Some(handle) = slot.channel.spawn_listener(inbound) {
                        *self.listener.lock() = Some(handle);
                    }
                    info!("[Backup] {} active", slot.channel.id());
                    return Ok(slot.channel.id().to_string());
                }
                Err(e) => {
                    warn!("[Backup] {} failed to activate: {}", slot.channel.id(), e);
                    *slot.status.write() = BackupStatus::Failed;
                    reasons.push(format!("{}: {}", slot.channel.id(), e));
                }
            }
        }

        Err(RelayError::backup(if reasons.is_empty() {
            "no backup channels configured".to_string()
        } else {
            reasons.join("; ")
        }))
    }

    /// Append to the bounded queue; oldest entries are evicted first so
    /// recency is preserved. `false` when no service is active.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.active.read().is_none() {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.len() == self.max_queue {
            queue.pop_front();
        }
        queue.push_back(envelope);
        true
    }

    /// Interval sync: durable kinds flush the queue to storage, network
    /// kinds deliver and prune
    pub async fn sync(&self) {
        let Some(channel) = self.active_channel() else {
            return;
        };
        let batch: Vec<Envelope> = self.queue.lock().iter().cloned().collect();
        if batch.is_empty() {
            return;
        }
        match channel.deliver(&batch).await {
            Ok(delivered) => {
                let mut queue = self.queue.lock();
                for _ in 0..delivered.min(queue.len()) {
                    queue.pop_front();
                }
                *self.last_sync_at.lock() = Some(Utc::now());
            }
            Err(e) => warn!("[Backup] sync failed on {}: {}", channel.id(), e),
        }
    }

    /// Hand the queued envelopes back for replay over a recovered primary
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Close streams and cancel timers; durable store contents are left
    /// in place intentionally
    pub async fn deactivate(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        let idx = self.active.write().take();
        if let Some(idx) = idx {
            self.slots[idx].channel.shutdown().await;
        }
        for slot in &self.slots {
            *slot.status.write() = BackupStatus::Standby;
        }
        info!("[Backup] deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn active_id(&self) -> Option<String> {
        self.active
            .read()
            .map(|idx| self.slots[idx].channel.id().to_string())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock()
    }

    fn active_channel(&self) -> Option<Arc<dyn BackupChannel>> {
        self.active
            .read()
            .map(|idx| Arc::clone(&self.slots[idx].channel))
    }
}
