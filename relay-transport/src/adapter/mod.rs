//! Uniform transport contract over every channel kind
//!
//! Each adapter turns its medium (websocket, SSE push stream, interval
//! polling, durable local store) into the same shape: an async `open`
//! bounded by the connect timeout, a [`Link`] control handle whose `send`
//! never errors, and a stream of [`LinkEvent`]s. The coordinator treats all
//! kinds identically.

pub mod durable;
pub mod poll;
pub mod push_stream;
pub mod websocket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use relay_core::{CloseFrame, Endpoint, EndpointKind, Envelope, RelayError};

pub use durable::DurableTransport;
pub use poll::PollTransport;
pub use push_stream::PushStreamTransport;
pub use websocket::WebSocketTransport;

/// Capacity of the per-link outbound and event channels
const LINK_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by an open link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Inbound envelope (already parsed; malformed frames are dropped and
    /// reported as `Error`)
    Message(Envelope),
    /// The link closed; code 1000 is a clean, intentional hand-off
    Closed { code: u16, reason: String },
    /// Non-fatal transport error (counted into the error rate)
    Error(String),
}

/// Control handle for one open connection
///
/// `send` never errors: it returns `false` when the channel is not in a
/// connected state. `close` is idempotent.
#[derive(Debug, Clone)]
pub struct Link {
    endpoint_id: String,
    outbound: mpsc::Sender<Envelope>,
    close_tx: mpsc::Sender<CloseFrame>,
    closed: Arc<AtomicBool>,
    cursor: Arc<RwLock<Option<String>>>,
}

impl Link {
    pub fn new(
        endpoint_id: impl Into<String>,
        outbound: mpsc::Sender<Envelope>,
        close_tx: mpsc::Sender<CloseFrame>,
        cursor: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            outbound,
            close_tx,
            closed: Arc::new(AtomicBool::new(false)),
            cursor,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Queue an envelope for transmission; `false` if the link is closed
    /// or its outbound buffer is full
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.outbound.try_send(envelope.clone()).is_ok()
    }

    /// Clone of the outbound sender, for callers that hold a send path
    /// without holding the link itself
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Close the link; repeated calls are no-ops
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[Link {}] closing ({} {})", self.endpoint_id, code, reason);
        let _ = self.close_tx.try_send(CloseFrame::new(code, reason));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resume cursor (timestamp or id of the last delivered message) for
    /// poll and push-stream kinds; `None` for duplex sockets
    pub fn last_cursor(&self) -> Option<String> {
        self.cursor.read().clone()
    }
}

/// Plumbing shared by every adapter: the channel set backing one link
pub struct LinkChannels {
    pub link: Link,
    pub events: mpsc::Receiver<LinkEvent>,
    pub outbound_rx: mpsc::Receiver<Envelope>,
    pub close_rx: mpsc::Receiver<CloseFrame>,
    pub event_tx: mpsc::Sender<LinkEvent>,
    pub cursor: Arc<RwLock<Option<String>>>,
}

/// Build the channel set for a new link, seeding the resume cursor
pub fn link_channels(endpoint_id: &str, cursor: Option<String>) -> LinkChannels {
    let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let (event_tx, events) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let (close_tx, close_rx) = mpsc::channel(4);
    let cursor = Arc::new(RwLock::new(cursor));
    let link = Link::new(endpoint_id, outbound_tx, close_tx, Arc::clone(&cursor));
    LinkChannels {
        link,
        events,
        outbound_rx,
        close_rx,
        event_tx,
        cursor,
    }
}

/// One implementation per transport kind
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> EndpointKind;

    /// Open a connection to the endpoint within the configured timeout.
    ///
    /// On timeout the adapter cancels the underlying attempt itself; no
    /// orphaned sockets. `cursor` resumes delivery for poll/push-stream
    /// kinds so already-seen messages are not re-delivered.
    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError>;
}

/// Maps endpoint kinds to their adapter implementation
///
/// Tests register mock transports; production uses [`standard`].
///
/// [`standard`]: TransportRegistry::standard
#[derive(Default)]
pub struct TransportRegistry {
    adapters: HashMap<EndpointKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four production adapters
    pub fn standard(config: &relay_core::RelayConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebSocketTransport::new(config.connect_timeout_ms)));
        registry.register(Arc::new(PushStreamTransport::new(config.connect_timeout_ms)));
        registry.register(Arc::new(PollTransport::new(
            config.connect_timeout_ms,
            config.poll_interval_ms,
        )));
        registry.register(Arc::new(DurableTransport::new(config.backup_max_queue_size)));
        registry
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.adapters.insert(transport.kind(), transport);
    }

    pub fn get(&self, kind: EndpointKind) -> Option<Arc<dyn Transport>> {
        self.adapters.get(&kind).cloned()
    }
}
