//! Server-push stream adapter (SSE)
//!
//! Inbound envelopes arrive as `data:` frames on a long-lived
//! `text/event-stream` response; the `Last-Event-ID` header resumes from
//! the cursor so already-seen messages are not re-delivered. Outbound
//! envelopes go as HTTP POSTs to the same address.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_core::{Endpoint, EndpointKind, Envelope, RelayError};

use super::{link_channels, Link, LinkEvent, Transport};

const CLOSE_ABNORMAL: u16 = 1006;

/// A parsed server-sent-event frame
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub id: Option<String>,
    pub data: Option<String>,
}

/// Parse one frame (the text between blank-line separators)
pub(crate) fn parse_sse_frame(frame: &str) -> SseFrame {
    let mut parsed = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        } else if let Some(rest) = line.strip_prefix("id:") {
            parsed.id = Some(rest.trim().to_string());
        }
        // "event:" names and ":" comments carry nothing the relay needs
    }
    if !data_lines.is_empty() {
        parsed.data = Some(data_lines.join("\n"));
    }
    parsed
}

pub struct PushStreamTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl PushStreamTransport {
    pub fn new(connect_timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }
}

#[async_trait]
impl Transport for PushStreamTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::PushStream
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError> {
        info!("[Relay SSE] Connecting to {}", endpoint.address);

        let mut request = self
            .client
            .get(&endpoint.address)
            .header("Accept", "text/event-stream");
        if let Some(ref last_id) = cursor {
            request = request.header("Last-Event-ID", last_id.clone());
        }

        let response = match timeout(self.connect_timeout, request.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_connect() => return Err(RelayError::refused(e.to_string())),
            Ok(Err(e)) => return Err(RelayError::protocol(e.to_string())),
            Err(_) => {
                return Err(RelayError::ConnectTimeout(
                    self.connect_timeout.as_millis() as u64
                ))
            }
        };
        if !response.status().is_success() {
            return Err(RelayError::refused(format!(
                "stream endpoint returned {}",
                response.status()
            )));
        }

        info!("[Relay SSE] Connected to {}", endpoint.id);

        let channels = link_channels(&endpoint.id, cursor);
        let event_tx = channels.event_tx.clone();
        let cursor_cell = channels.cursor.clone();
        let mut outbound_rx = channels.outbound_rx;
        let mut close_rx = channels.close_rx;
        let endpoint_id = endpoint.id.clone();
        let address = endpoint.address.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                tokio::select! {
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(pos) = buffer.find("\n\n") {
                                    let frame: String = buffer.drain(..pos + 2).collect();
                                    let parsed = parse_sse_frame(&frame);
                                    if let Some(id) = parsed.id {
                                        *cursor_cell.write() = Some(id);
                                    }
                                    if let Some(data) = parsed.data {
                                        match Envelope::from_json(&data) {
                                            Ok(envelope) => {
                                                let _ = event_tx.send(LinkEvent::Message(envelope)).await;
                                            }
                                            Err(e) => {
                                                warn!("[Relay SSE {}] dropping malformed frame: {}", endpoint_id, e);
                                                let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                            }
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!("[Relay SSE {}] stream error: {}", endpoint_id, e);
                                let _ = event_tx.send(LinkEvent::Closed {
                                    code: CLOSE_ABNORMAL,
                                    reason: e.to_string(),
                                }).await;
                                break;
                            }
                            None => {
                                debug!("[Relay SSE {}] stream ended", endpoint_id);
                                let _ = event_tx.send(LinkEvent::Closed {
                                    code: CLOSE_ABNORMAL,
                                    reason: "stream ended".to_string(),
                                }).await;
                                break;
                            }
                        }
                    }

                    envelope = outbound_rx.recv() => {
                        match envelope {
                            Some(envelope) => {
                                // One-directional stream; a live response body
                                // is the liveness signal, so answer locally
                                if envelope.kind == relay_core::EnvelopeKind::Ping {
                                    let pong = Envelope::pong(envelope.timestamp_ms);
                                    let _ = event_tx.send(LinkEvent::Message(pong)).await;
                                    continue;
                                }
                                let result = client.post(&address).json(&envelope).send().await;
                                match result {
                                    Ok(resp) if resp.status().is_success() => {}
                                    Ok(resp) => {
                                        warn!("[Relay SSE {}] outbound rejected: {}", endpoint_id, resp.status());
                                        let _ = event_tx.send(LinkEvent::Error(
                                            format!("outbound rejected: {}", resp.status()),
                                        )).await;
                                    }
                                    Err(e) => {
                                        warn!("[Relay SSE {}] outbound failed: {}", endpoint_id, e);
                                        let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                    }
                                }
                            }
                            None => break,
                        }
                    }

                    frame = close_rx.recv() => {
                        let frame = frame.unwrap_or_else(relay_core::CloseFrame::switching);
                        let _ = event_tx.send(LinkEvent::Closed {
                            code: frame.code,
                            reason: frame.reason,
                        }).await;
                        // Dropping the response stream closes the connection
                        break;
                    }
                }
            }

            debug!("[Relay SSE {}] io task finished", endpoint_id);
        });

        Ok((channels.link, channels.events))
    }
}
