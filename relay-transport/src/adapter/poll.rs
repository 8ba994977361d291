//! Interval-poll HTTP adapter
//!
//! Lowest-fidelity network transport: a GET loop with a `since` cursor for
//! inbound envelopes and POSTs for outbound. A single failed poll is
//! tolerated; a streak of them is reported as an abnormal close so the
//! coordinator can fail over.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use relay_core::{Endpoint, EndpointKind, Envelope, RelayError};

use super::{link_channels, Link, LinkEvent, Transport};

const CLOSE_ABNORMAL: u16 = 1006;

/// Consecutive poll failures tolerated before reporting a close
const MAX_POLL_FAILURES: u32 = 3;

pub struct PollTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl PollTransport {
    pub fn new(connect_timeout_ms: u64, poll_interval_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    async fn fetch(
        client: &reqwest::Client,
        address: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<Envelope>, RelayError> {
        let mut request = client.get(address);
        if let Some(since) = cursor {
            request = request.query(&[("since", since)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::refused(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::refused(format!(
                "poll endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<Envelope>>()
            .await
            .map_err(|e| RelayError::malformed(e.to_string()))
    }
}

#[async_trait]
impl Transport for PollTransport {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Poll
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        cursor: Option<String>,
    ) -> Result<(Link, mpsc::Receiver<LinkEvent>), RelayError> {
        info!("[Relay Poll] Probing {}", endpoint.address);

        // The initial poll doubles as the connect check
        let initial = timeout(
            self.connect_timeout,
            Self::fetch(&self.client, &endpoint.address, cursor.as_deref()),
        )
        .await
        .map_err(|_| RelayError::ConnectTimeout(self.connect_timeout.as_millis() as u64))??;

        info!("[Relay Poll] Connected to {}", endpoint.id);

        let channels = link_channels(&endpoint.id, cursor);
        let event_tx = channels.event_tx.clone();
        let cursor_cell = channels.cursor.clone();
        let mut outbound_rx = channels.outbound_rx;
        let mut close_rx = channels.close_rx;
        let endpoint_id = endpoint.id.clone();
        let address = endpoint.address.clone();
        let client = self.client.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            // Deliver whatever the probe already fetched
            for envelope in initial {
                *cursor_cell.write() = Some(envelope.timestamp_ms.to_string());
                let _ = event_tx.send(LinkEvent::Message(envelope)).await;
            }

            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures = 0u32;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let since = cursor_cell.read().clone();
                        match Self::fetch(&client, &address, since.as_deref()).await {
                            Ok(batch) => {
                                failures = 0;
                                for envelope in batch {
                                    *cursor_cell.write() = Some(envelope.timestamp_ms.to_string());
                                    let _ = event_tx.send(LinkEvent::Message(envelope)).await;
                                }
                            }
                            Err(e) => {
                                failures += 1;
                                warn!("[Relay Poll {}] poll failed ({}/{}): {}", endpoint_id, failures, MAX_POLL_FAILURES, e);
                                let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                                if failures >= MAX_POLL_FAILURES {
                                    let _ = event_tx.send(LinkEvent::Closed {
                                        code: CLOSE_ABNORMAL,
                                        reason: format!("{} consecutive poll failures", failures),
                                    }).await;
                                    break;
                                }
                            }
                        }
                    }

                    envelope = outbound_rx.recv() => {
                        match envelope {
                            Some(envelope) => {
                                // No round trip on this kind; the poll loop
                                // itself proves liveness, so answer locally
                                if envelope.kind == relay_core::EnvelopeKind::Ping {
                                    let pong = Envelope::pong(envelope.timestamp_ms);
                                    let _ = event_tx.send(LinkEvent::Message(pong)).await;
                                    continue;
                                }
                                let result = client.post(&address).json(&envelope).send().await;
                                if let Err(e) = result {
                                    warn!("[Relay Poll {}] outbound failed: {}", endpoint_id, e);
                                    let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
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
                        break;
                    }
                }
            }

            debug!("[Relay Poll {}] poll task finished", endpoint_id);
        });

        Ok((channels.link, channels.events))
    }
}
