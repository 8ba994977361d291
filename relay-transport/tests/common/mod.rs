#![allow(dead_code)]

//! Shared test harness: an in-process mock transport with per-endpoint
//! refusal toggles, an event injector, and a log of outbound envelopes.
//! Pings are answered automatically so paused-clock tests never trip the
//! heartbeat deadline by accident; `silence` turns that off per endpoint
//! to simulate a peer that stops responding.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use relay_core::{
    Endpoint, EndpointKind, Envelope, EnvelopeKind, RelayConfig, RelayError,
};
use relay_transport::adapter::{link_channels, Link, LinkEvent, Transport, TransportRegistry};
use relay_transport::backup::BackupPool;
use relay_transport::manager::SharedState;
use relay_transport::{Coordinator, HealthMonitor, HealthThresholds, RelayEvent};

pub struct MockHandle {
    pub inject: mpsc::Sender<LinkEvent>,
    pub sent: Arc<Mutex<Vec<Envelope>>>,
}

pub struct MockTransport {
    kind: EndpointKind,
    refused: Mutex<HashSet<String>>,
    silent: Arc<Mutex<HashSet<String>>>,
    attempts: Mutex<Vec<String>>,
    handles: Mutex<HashMap<String, MockHandle>>,
}

impl MockTransport {
    pub fn new(kind: EndpointKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            refused: Mutex::new(HashSet::new()),
            silent: Arc::new(Mutex::new(HashSet::new())),
            attempts: Mutex::new(Vec::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Swallow heartbeat pings on this endpoint: the link accepts them
    /// but no pong ever comes back
    pub fn silence(&self, endpoint_id: &str) {
        self.silent.lock().insert(endpoint_id.to_string());
    }

    /// Refuse every open of this endpoint until `allow` is called
    pub fn refuse(&self, endpoint_id: &str) {
        self.refused.lock().insert(endpoint_id.to_string());
    }

    pub fn allow(&self, endpoint_id: &str) {
        self.refused.lock().remove(endpoint_id);
    }

    /// Endpoint ids in open-attempt order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Push a link event into the most recent session of this endpoint
    pub async fn inject(&self, endpoint_id: &str, event: LinkEvent) {
        let tx = self
            .handles
            .lock()
            .get(endpoint_id)
            .map(|h| h.inject.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Non-heartbeat envelopes the most recent session transmitted
    pub fn sent(&self, endpoint_id: &str) -> Vec<Envelope> {
        self.handles
            .lock()
            .get(endpoint_id)
            .map(|h| h.sent.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError> {
        self.attempts.lock().push(endpoint.id.clone());
        if self.refused.lock().contains(&endpoint.id) {
            return Err(RelayError::refused("mock refused"));
        }

        let channels = link_channels(&endpoint.id, cursor);
        let (inject_tx, mut inject_rx) = mpsc::channel(64);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let event_tx = channels.event_tx.clone();
        let mut outbound_rx = channels.outbound_rx;
        let mut close_rx = channels.close_rx;
        let sent_log = Arc::clone(&sent);
        let silent = Arc::clone(&self.silent);
        let endpoint_id = endpoint.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => {
                            if envelope.kind == EnvelopeKind::Ping {
                                if silent.lock().contains(&endpoint_id) {
                                    continue;
                                }
                                let pong = Envelope::pong(envelope.timestamp_ms);
                                let _ = event_tx.send(LinkEvent::Message(pong)).await;
                            } else {
                                sent_log.lock().push(envelope);
                            }
                        }
                        None => break,
                    },

                    frame = close_rx.recv() => {
                        let frame = frame.unwrap_or_else(relay_core::CloseFrame::switching);
                        let _ = event_tx.send(LinkEvent::Closed {
                            code: frame.code,
                            reason: frame.reason,
                        }).await;
                        break;
                    },

                    event = inject_rx.recv() => match event {
                        Some(event) => {
                            let closing = matches!(event, LinkEvent::Closed { .. });
                            let _ = event_tx.send(event).await;
                            if closing {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        self.handles.lock().insert(
            endpoint.id.clone(),
            MockHandle {
                inject: inject_tx,
                sent,
            },
        );
        Ok((channels.link, channels.events))
    }
}

// ----------------------------------------------------------------------
// Builders
// ----------------------------------------------------------------------

pub fn ws_endpoint(id: &str, priority: u8) -> Endpoint {
    Endpoint::new(
        id,
        format!("wss://{id}.test"),
        EndpointKind::WebSocket,
        priority,
    )
}

pub fn test_config(
    endpoints: Vec<Endpoint>,
    backup: relay_core::BackupChannels,
) -> RelayConfig {
    RelayConfig {
        endpoints,
        backup,
        ..RelayConfig::default()
    }
}

pub fn registry_with(mock: Arc<MockTransport>) -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register(mock);
    registry
}

/// A coordinator with no backup channels, for direct-drive tests
pub fn build_coordinator(
    config: RelayConfig,
    registry: TransportRegistry,
) -> (Coordinator, broadcast::Receiver<RelayEvent>) {
    let shared = Arc::new(SharedState::new(0));
    let monitor = Arc::new(HealthMonitor::new(
        HealthThresholds::default(),
        config.failover_threshold_ms,
        0,
    ));
    let backup = Arc::new(BackupPool::new(Vec::new(), config.backup_max_queue_size));
    let (events, rx) = broadcast::channel(256);
    let coordinator = Coordinator::new(
        config,
        Arc::new(registry),
        monitor,
        backup,
        shared,
        events,
    );
    (coordinator, rx)
}

pub async fn next_event(rx: &mut broadcast::Receiver<RelayEvent>) -> RelayEvent {
    tokio::time::timeout(Duration::from_secs(300), rx.recv())
        .await
        .expect("timed out waiting for a relay event")
        .expect("event channel closed")
}

/// Consume events until `matches` accepts one, returning the full trace
pub async fn events_until(
    rx: &mut broadcast::Receiver<RelayEvent>,
    matches: impl Fn(&RelayEvent) -> bool,
) -> Vec<RelayEvent> {
    let mut trace = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches(&event);
        trace.push(event);
        if done {
            return trace;
        }
    }
}

pub fn temp_path(suffix: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let unique = (std::process::id() as u64) << 16 | COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("relay-test-{unique:x}-{suffix}"))
}
