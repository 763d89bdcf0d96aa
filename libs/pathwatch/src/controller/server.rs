// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Controller WebSocket endpoint serving `probe_get` / `probe_post`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::control::{AGENT_WS_PATH, ControlMessage};
use crate::core::{AgentId, PathwatchError, Result, ResultRecord};

use super::resolver::TargetResolver;
use super::sink::ResultSink;
use super::store::{ControllerStore, NetInfoSample};

/// The first frame must be `auth` and arrive within this window.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ControllerState {
    store: Arc<dyn ControllerStore>,
    resolver: Arc<TargetResolver>,
    sink: Arc<dyn ResultSink>,
    started_at: Instant,
}

impl ControllerState {
    pub fn new(store: Arc<dyn ControllerStore>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            resolver: Arc::new(TargetResolver::new(store.clone())),
            store,
            sink,
            started_at: Instant::now(),
        }
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    fn authenticate(&self, agent_id: AgentId, token: &str) -> Result<()> {
        let record = self
            .store
            .agent(agent_id)
            .ok_or_else(|| PathwatchError::Auth(format!("unknown agent {}", agent_id)))?;
        if record.token.is_empty() || record.token != token {
            return Err(PathwatchError::Auth(format!(
                "invalid token for agent {}",
                agent_id
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

/// Build the controller router.
pub fn router(state: ControllerState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/health", get(health))
        .route(AGENT_WS_PATH, get(agent_websocket_handler))
        .layer(trace_layer)
        .with_state(state)
}

/// Serve the controller on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ControllerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!("[Controller] Listening on {}", local);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!("[Controller] Stopped");
    Ok(())
}

async fn health(State(state): State<ControllerState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn agent_websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<ControllerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, remote, state))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_frame(sender: &mut WsSender, msg: &ControlMessage) -> bool {
    match msg.to_json() {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("[Controller] Failed to encode {}: {}", msg.event_name(), e);
            true
        }
    }
}

async fn handle_agent_socket(socket: WebSocket, remote: SocketAddr, state: ControllerState) {
    let (mut sender, mut receiver) = socket.split();

    let first = tokio::time::timeout(AUTH_TIMEOUT, receiver.next()).await;
    let agent_id = match first {
        Ok(Some(Ok(Message::Text(text)))) => match ControlMessage::from_json(&text) {
            Ok(ControlMessage::Auth { agent_id, token }) => {
                match state.authenticate(agent_id, &token) {
                    Ok(()) => agent_id,
                    Err(e) => {
                        tracing::warn!("[Controller] Rejected connection from {}: {}", remote, e);
                        send_frame(&mut sender, &ControlMessage::error(e.to_string())).await;
                        let _ = sender.close().await;
                        return;
                    }
                }
            }
            Ok(other) => {
                tracing::warn!(
                    "[Controller] Expected auth from {}, got {}",
                    remote,
                    other.event_name()
                );
                send_frame(&mut sender, &ControlMessage::error("auth required")).await;
                let _ = sender.close().await;
                return;
            }
            Err(e) => {
                tracing::warn!("[Controller] Malformed auth frame from {}: {}", remote, e);
                let _ = sender.close().await;
                return;
            }
        },
        Ok(_) => {
            tracing::debug!("[Controller] Connection from {} closed before auth", remote);
            return;
        }
        Err(_) => {
            tracing::warn!("[Controller] Auth timeout for {}", remote);
            let _ = sender.close().await;
            return;
        }
    };

    if !send_frame(&mut sender, &ControlMessage::AuthOk { agent_id }).await {
        return;
    }

    state.store.record_netinfo(NetInfoSample {
        agent_id,
        public_address: remote.ip().to_string(),
        observed_at: Utc::now(),
    });
    tracing::info!("[Controller] Agent {} connected from {}", agent_id, remote);

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("[Controller] Agent {} socket error: {}", agent_id, e);
                break;
            }
        };

        let reply = match ControlMessage::from_json(&text) {
            Ok(ControlMessage::ProbeGet { .. }) => {
                let probes = state.resolver.resolve(agent_id);
                tracing::debug!(
                    "[Controller] probe_get from agent {}: {} probe(s)",
                    agent_id,
                    probes.len()
                );
                ControlMessage::ProbeGetOk { probes }
            }
            Ok(ControlMessage::ProbePost(result)) => {
                let probe_id = result.probe_id;
                let created_at = result.created_at;
                let record = ResultRecord {
                    agent_id,
                    received_at: Utc::now(),
                    result,
                };
                match state.sink.append(record) {
                    Ok(()) => ControlMessage::ProbePostOk {
                        probe_id,
                        created_at,
                    },
                    Err(e) => {
                        tracing::error!(
                            "[Controller] Failed to store result for probe {}: {}",
                            probe_id,
                            e
                        );
                        ControlMessage::error(format!("failed to store result: {}", e))
                    }
                }
            }
            Ok(other) => ControlMessage::error(format!("unexpected {}", other.event_name())),
            Err(e) => {
                tracing::debug!("[Controller] Bad frame from agent {}: {}", agent_id, e);
                ControlMessage::error("malformed frame")
            }
        };

        if !send_frame(&mut sender, &reply).await {
            break;
        }
    }

    tracing::info!("[Controller] Agent {} disconnected", agent_id);
}
