// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Agent end of the control-plane WebSocket.
//!
//! One task owns the socket. It authenticates on every connect, pulls the
//! probe set on connect and on each poll interval, and is the single writer
//! for results queued by sessions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::control::ControlMessage;
use crate::core::{AgentConfig, PathwatchError, Probe, ProbeResult, ReconnectConfig, Result};

use super::shutdown::ShutdownSignal;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

/// Exponential reconnect delay with ±20 % jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms.max(1)),
            max: Duration::from_millis(config.max_ms.max(config.base_ms).max(1)),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = 0.8 + fastrand::f64() * 0.4;
        exp.mul_f64(jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum Disconnect {
    Shutdown,
    Closed,
}

pub struct ControlChannel {
    config: Arc<AgentConfig>,
    backoff: Backoff,
    /// A result taken off the queue but not yet written.
    pending: Option<ProbeResult>,
}

impl ControlChannel {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            backoff: Backoff::new(&config.reconnect),
            config,
            pending: None,
        }
    }

    /// Run until shutdown, reconnecting with backoff. Probe sets received
    /// from the controller are forwarded on `probes`.
    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<ProbeResult>,
        probes: mpsc::Sender<Vec<Probe>>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.connect_once(&mut results, &probes, &mut shutdown).await {
                Ok(Disconnect::Shutdown) => break,
                Ok(Disconnect::Closed) => {
                    tracing::info!("[ControlChannel] Connection closed by controller");
                }
                Err(e) => {
                    tracing::warn!("[ControlChannel] {}", e);
                }
            }

            let delay = self.backoff.next_delay();
            tracing::info!("[ControlChannel] Reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("[ControlChannel] Stopped");
    }

    async fn connect_once(
        &mut self,
        results: &mut mpsc::Receiver<ProbeResult>,
        probes: &mpsc::Sender<Vec<Probe>>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Disconnect> {
        let url = self.config.controller_url.as_str();
        let (ws, _response) = tokio::select! {
            _ = shutdown.wait() => return Ok(Disconnect::Shutdown),
            connected = connect_async(url) => connected?,
        };
        let (mut write, mut read) = ws.split();
        tracing::debug!("[ControlChannel] Connected to {}", url);

        send(
            &mut write,
            &ControlMessage::Auth {
                agent_id: self.config.agent_id,
                token: self.config.token.clone(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(AUTH_TIMEOUT, next_frame(&mut read))
            .await
            .map_err(|_| PathwatchError::Auth("timed out waiting for auth_ok".to_string()))??;
        match reply {
            Some(ControlMessage::AuthOk { .. }) => {}
            Some(ControlMessage::Error { message }) => return Err(PathwatchError::Auth(message)),
            Some(other) => {
                return Err(PathwatchError::Protocol(format!(
                    "expected auth_ok, got {}",
                    other.event_name()
                )));
            }
            None => return Ok(Disconnect::Closed),
        }
        self.backoff.reset();
        tracing::info!(
            "[ControlChannel] Agent {} authenticated with {}",
            self.config.agent_id,
            url
        );

        let probe_get = ControlMessage::ProbeGet {
            agent_id: self.config.agent_id,
        };
        send(&mut write, &probe_get).await?;

        if let Some(result) = self.pending.clone() {
            tracing::debug!(
                "[ControlChannel] Re-sending held result for probe {}",
                result.probe_id
            );
            send(&mut write, &ControlMessage::ProbePost(result)).await?;
            self.pending = None;
        }

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    while let Ok(result) = results.try_recv() {
                        if send(&mut write, &ControlMessage::ProbePost(result)).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(Disconnect::Shutdown);
                }
                _ = poll.tick() => {
                    send(&mut write, &probe_get).await?;
                }
                queued = results.recv() => {
                    let Some(result) = queued else {
                        return Ok(Disconnect::Shutdown);
                    };
                    self.pending = Some(result.clone());
                    send(&mut write, &ControlMessage::ProbePost(result)).await?;
                    self.pending = None;
                }
                frame = read.next() => match frame {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(Disconnect::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(WsMessage::Text(text))) => handle_frame(&text, probes).await,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send(write: &mut WsWrite, msg: &ControlMessage) -> Result<()> {
    write.send(WsMessage::Text(msg.to_json()?.into())).await?;
    Ok(())
}

/// Next control frame, skipping non-text frames. `None` when the socket closes.
async fn next_frame(read: &mut WsRead) -> Result<Option<ControlMessage>> {
    while let Some(frame) = read.next().await {
        match frame? {
            WsMessage::Text(text) => return ControlMessage::from_json(&text).map(Some),
            WsMessage::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

async fn handle_frame(text: &str, probes: &mpsc::Sender<Vec<Probe>>) {
    match ControlMessage::from_json(text) {
        Ok(ControlMessage::ProbeGetOk { probes: set }) => {
            tracing::debug!("[ControlChannel] Received {} probe(s)", set.len());
            if probes.send(set).await.is_err() {
                tracing::debug!("[ControlChannel] Dispatcher gone, dropping probe set");
            }
        }
        Ok(ControlMessage::ProbePostOk { probe_id, .. }) => {
            tracing::trace!("[ControlChannel] Result for probe {} acknowledged", probe_id);
        }
        Ok(ControlMessage::Error { message }) => {
            tracing::warn!("[ControlChannel] Controller error: {}", message);
        }
        Ok(other) => {
            tracing::debug!("[ControlChannel] Ignoring {}", other.event_name());
        }
        Err(e) => {
            tracing::warn!("[ControlChannel] Malformed frame: {}", e);
        }
    }
}
