//! Network backup channels
//!
//! Lower-fidelity stand-ins for the primary pool: a server-push stream
//! (SSE) and interval polling. Both deliver the queued batch as HTTP POSTs
//! and, while active, forward inbound envelopes into the coordinator's
//! funnel so consumers keep receiving data during an outage.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relay_core::{Envelope, RelayError, RelayResult};

use crate::adapter::push_stream::parse_sse_frame;

use super::{BackupChannel, BackupKind};

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);

async fn post_batch(
    client: &reqwest::Client,
    address: &str,
    batch: &[Envelope],
) -> RelayResult<usize> {
    let response = client
        .post(address)
        .json(batch)
        .send()
        .await
        .map_err(|e| RelayError::refused(e.to_string()))?;
    if !response.status().is_success() {
        return Err(RelayError::refused(format!(
            "backup endpoint returned {}",
            response.status()
        )));
    }
    Ok(batch.len())
}

// ============================================================================
// Server-push stream backup
// ============================================================================

/// SSE-based backup: probe and outbound over HTTP, inbound as a long-lived
/// event stream
pub struct PushStreamBackup {
    id: String,
    address: String,
    client: reqwest::Client,
    cursor: Arc<RwLock<Option<String>>>,
}

impl PushStreamBackup {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            client: reqwest::Client::new(),
            cursor: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl BackupChannel for PushStreamBackup {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackupKind {
        BackupKind::PushStream
    }

    /// Active only once the remote side acknowledges the stream request
    async fn probe(&self) -> RelayResult<()> {
        let response = self
            .client
            .get(&self.address)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| RelayError::refused(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::refused(format!(
                "stream endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn deliver(&self, batch: &[Envelope]) -> RelayResult<usize> {
        post_batch(&self.client, &self.address, batch).await
    }

    fn spawn_listener(&self, inbound: mpsc::Sender<Envelope>) -> Option<JoinHandle<()>> {
        let client = self.client.clone();
        let address = self.address.clone();
        let id = self.id.clone();
        let cursor = Arc::clone(&self.cursor);

        Some(tokio::spawn(async move {
            // The stream is re-opened from the last event id after drops;
            // the pool aborts this task on deactivation
            while !inbound.is_closed() {
                let mut request = client.get(&address).header("Accept", "text/event-stream");
                if let Some(ref last_id) = *cursor.read() {
                    request = request.header("Last-Event-ID", last_id.clone());
                }
                let response = match request.send().await {
                    Ok(resp) if resp.status().is_success() => resp,
                    Ok(resp) => {
                        warn!("[Backup SSE {}] stream rejected: {}", id, resp.status());
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("[Backup SSE {}] stream failed: {}", id, e);
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        continue;
                    }
                };

                let mut stream = response.bytes_stream();
                let mut buffer = String::new();
                while let Some(chunk) = stream.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("[Backup SSE {}] stream error: {}", id, e);
                            break;
                        }
                    };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find("\n\n") {
                        let frame: String = buffer.drain(..pos + 2).collect();
                        let parsed = parse_sse_frame(&frame);
                        if let Some(frame_id) = parsed.id {
                            *cursor.write() = Some(frame_id);
                        }
                        if let Some(data) = parsed.data {
                            match Envelope::from_json(&data) {
                                Ok(envelope) => {
                                    if inbound.send(envelope).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!("[Backup SSE {}] dropping malformed frame: {}", id, e)
                                }
                            }
                        }
                    }
                }
                debug!("[Backup SSE {}] stream ended, reconnecting", id);
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        }))
    }
}

// ============================================================================
// Interval-poll backup
// ============================================================================

/// Poll-based backup: probe and outbound over HTTP, inbound by fetching
/// batches on an interval
pub struct PollBackup {
    id: String,
    address: String,
    client: reqwest::Client,
    interval: Duration,
    cursor: Arc<RwLock<Option<String>>>,
}

impl PollBackup {
    pub fn new(id: impl Into<String>, address: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            client: reqwest::Client::new(),
            interval: Duration::from_millis(interval_ms),
            cursor: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl BackupChannel for PollBackup {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackupKind {
        BackupKind::Poll
    }

    async fn probe(&self) -> RelayResult<()> {
        let response = self
            .client
            .get(&self.address)
            .send()
            .await
            .map_err(|e| RelayError::refused(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::refused(format!(
                "poll endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn deliver(&self, batch: &[Envelope]) -> RelayResult<usize> {
        post_batch(&self.client, &self.address, batch).await
    }

    fn spawn_listener(&self, inbound: mpsc::Sender<Envelope>) -> Option<JoinHandle<()>> {
        let client = self.client.clone();
        let address = self.address.clone();
        let id = self.id.clone();
        let cursor = Arc::clone(&self.cursor);
        let interval = self.interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if inbound.is_closed() {
                    return;
                }

                let since = cursor.read().clone();
                let mut request = client.get(&address);
                if let Some(ref since) = since {
                    request = request.query(&[("since", since.as_str())]);
                }
                let batch: Vec<Envelope> = match request.send().await {
                    Ok(resp) if resp.status().is_success() => match resp.json().await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("[Backup Poll {}] bad response body: {}", id, e);
                            continue;
                        }
                    },
                    Ok(resp) => {
                        warn!("[Backup Poll {}] poll rejected: {}", id, resp.status());
                        continue;
                    }
                    Err(e) => {
                        warn!("[Backup Poll {}] poll failed: {}", id, e);
                        continue;
                    }
                };

                for envelope in batch {
                    *cursor.write() = Some(envelope.timestamp_ms.to_string());
                    if inbound.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
        }))
    }
}
