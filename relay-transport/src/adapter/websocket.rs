//! Persistent duplex socket adapter
//!
//! Envelopes travel as JSON text frames. The io task owns the socket and
//! multiplexes outbound envelopes, close commands, and inbound frames with
//! a single `select!` loop; dropping the task tears the socket down.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use relay_core::{Endpoint, EndpointKind, Envelope, RelayError};

use super::{link_channels, Link, LinkEvent, Transport};

/// Abnormal-closure code reported when the stream ends without a close frame
const CLOSE_ABNORMAL: u16 = 1006;

pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout_ms: u64) -> Self {
        Self {
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::WebSocket
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError> {
        info!("[Relay WS] Connecting to {}", endpoint.address);

        let connect = connect_async(endpoint.address.as_str());
        let (ws_stream, _) = match timeout(self.connect_timeout, connect).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(tungstenite::Error::Io(e))) => {
                return Err(RelayError::refused(e.to_string()));
            }
            Ok(Err(e)) => return Err(RelayError::protocol(e.to_string())),
            // Dropping the connect future cancels the attempt
            Err(_) => return Err(RelayError::ConnectTimeout(self.connect_timeout.as_millis() as u64)),
        };

        info!("[Relay WS] Connected to {}", endpoint.id);

        let channels = link_channels(&endpoint.id, cursor);
        let event_tx = channels.event_tx.clone();
        let mut outbound_rx = channels.outbound_rx;
        let mut close_rx = channels.close_rx;
        let endpoint_id = endpoint.id.clone();

        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match Envelope::from_json(&text) {
                                    Ok(envelope) => {
                                        let _ = event_tx.send(LinkEvent::Message(envelope)).await;
                                    }
                                    Err(e) => {
                                        // Logged and dropped, never crashes the receive loop
                                        warn!("[Relay WS {}] dropping malformed frame: {}", endpoint_id, e);
                                        let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    let _ = event_tx
                                        .send(LinkEvent::Closed {
                                            code: CLOSE_ABNORMAL,
                                            reason: "pong send failed".to_string(),
                                        })
                                        .await;
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = match frame {
                                    Some(f) => (u16::from(f.code), f.reason.to_string()),
                                    None => (CLOSE_ABNORMAL, "closed without frame".to_string()),
                                };
                                info!("[Relay WS {}] closed by peer ({} {})", endpoint_id, code, reason);
                                let _ = event_tx.send(LinkEvent::Closed { code, reason }).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("[Relay WS {}] stream error: {}", endpoint_id, e);
                                let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                let _ = event_tx
                                    .send(LinkEvent::Closed {
                                        code: CLOSE_ABNORMAL,
                                        reason: e.to_string(),
                                    })
                                    .await;
                                break;
                            }
                            None => {
                                debug!("[Relay WS {}] stream ended", endpoint_id);
                                let _ = event_tx
                                    .send(LinkEvent::Closed {
                                        code: CLOSE_ABNORMAL,
                                        reason: "stream ended".to_string(),
                                    })
                                    .await;
                                break;
                            }
                        }
                    }

                    envelope = outbound_rx.recv() => {
                        match envelope {
                            Some(envelope) => {
                                let json = envelope.to_json();
                                if let Err(e) = write.send(Message::Text(json.into())).await {
                                    warn!("[Relay WS {}] send failed: {}", endpoint_id, e);
                                    let _ = event_tx
                                        .send(LinkEvent::Closed {
                                            code: CLOSE_ABNORMAL,
                                            reason: e.to_string(),
                                        })
                                        .await;
                                    break;
                                }
                            }
                            // Link dropped; treat as a clean local shutdown
                            None => break,
                        }
                    }

                    frame = close_rx.recv() => {
                        let frame = frame.unwrap_or_else(relay_core::CloseFrame::switching);
                        let ws_frame = WsCloseFrame {
                            code: CloseCode::from(frame.code),
                            reason: frame.reason.clone().into(),
                        };
                        let _ = write.send(Message::Close(Some(ws_frame))).await;
                        let _ = event_tx
                            .send(LinkEvent::Closed {
                                code: frame.code,
                                reason: frame.reason,
                            })
                            .await;
                        break;
                    }
                }
            }

            debug!("[Relay WS {}] io task finished", endpoint_id);
        });

        Ok((channels.link, channels.events))
    }
}
