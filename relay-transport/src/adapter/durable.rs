//! Durable local store as a transport
//!
//! Satisfies the same adapter contract as the network kinds: `open`
//! verifies the store is writable, `send` persists the envelope. There is
//! no inbound traffic; in practice durable endpoints serve the backup pool
//! path rather than the primary pool.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_core::{Endpoint, EndpointKind, Envelope, RelayError};

use crate::backup::store::{DurablePort, FlatLogPort, SqlitePort};

use super::{link_channels, Link, LinkEvent, Transport};

pub struct DurableTransport {
    max_entries: usize,
}

impl DurableTransport {
    /// `max_entries` bounds the flat-log variant; sqlite stores are
    /// bounded by the pool's queue cap instead
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// The endpoint address is the store path; `.db`/`.sqlite` selects the
    /// indexed store, anything else the flat log
    fn open_port(&self, address: &str) -> Result<Box<dyn DurablePort>, RelayError> {
        let indexed = address.ends_with(".db") || address.ends_with(".sqlite");
        if indexed {
            Ok(Box::new(SqlitePort::new(address)?))
        } else {
            Ok(Box::new(FlatLogPort::new(address, self.max_entries)?))
        }
    }
}

#[async_trait]
impl Transport for DurableTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Durable
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError> {
        let port = self.open_port(&endpoint.address)?;
        // Active once the storage handle is confirmed writable
        port.flush()?;
        info!("[Relay Store] {} writable at {}", port.name(), endpoint.address);

        let channels = link_channels(&endpoint.id, cursor);
        let event_tx = channels.event_tx.clone();
        let mut outbound_rx = channels.outbound_rx;
        let mut close_rx = channels.close_rx;
        let endpoint_id = endpoint.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = outbound_rx.recv() => {
                        match envelope {
                            Some(envelope) => {
                                // Heartbeats are transient; answer pings
                                // locally, persist only real traffic
                                if envelope.kind == relay_core::EnvelopeKind::Ping {
                                    let pong = Envelope::pong(envelope.timestamp_ms);
                                    let _ = event_tx.send(LinkEvent::Message(pong)).await;
                                    continue;
                                }
                                if envelope.is_heartbeat() {
                                    continue;
                                }
                                if let Err(e) = port.put(&envelope) {
                                    warn!("[Relay Store {}] write failed: {}", endpoint_id, e);
                                    let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                }
                            }
                            None => break,
                        }
                    }

                    frame = close_rx.recv() => {
                        let frame = frame.unwrap_or_else(relay_core::CloseFrame::switching);
                        let _ = port.flush();
                        let _ = event_tx.send(LinkEvent::Closed {
                            code: frame.code,
                            reason: frame.reason,
                        }).await;
                        break;
                    }
                }
            }
            debug!("[Relay Store {}] task finished", endpoint_id);
        });

        Ok((channels.link, channels.events))
    }
}
