// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Continuous UDP traffic simulation between two agents.
//!
//! A client streams DATA packets to a server agent and closes a cycle every
//! `report_seq` packets. The server ACKs DATA and measures the reverse path
//! with its own PINGs. Every closed cycle becomes one report, and cycles that
//! cross the loss, latency or jitter thresholds ask the dispatcher for a
//! diagnostic.

mod baseline;
mod client;
mod cycle;
mod interface;
mod message;
mod monitor;
mod report;
mod server;
mod state;
mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agent::{ProbeHandler, SessionContext, ShutdownSignal};
use crate::core::{PathwatchError, Result, port_of};

pub use baseline::{
    AnomalyDetector, AnomalyReason, Baseline, FrozenBaseline, JITTER_FACTOR, LATENCY_FACTOR,
    LOSS_THRESHOLD_PCT,
};
pub use client::ClientSession;
pub use cycle::{AckOutcome, CycleSummary, CycleTracker, CycleWindow};
pub use interface::{InterfaceSelector, InterfaceSource, NetInterface, SystemInterfaces};
pub use message::{MAX_DATAGRAM, Message, MessageKind};
pub use monitor::{InterfaceEvent, InterfaceMonitor};
pub use report::{CycleReport, handshake_failure_stats};
pub use server::{PeerCycle, PeerTable, ServerSession, TickOutput};
pub use state::{ConnectionState, StateMachine};
pub use stats::{Distribution, FlowDirection, FlowStats, ReceiveCounters};

/// Starts a client or server session depending on the probe's server flag.
pub struct TrafficSimHandler {
    interfaces: Arc<dyn InterfaceSource>,
}

impl Default for TrafficSimHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficSimHandler {
    pub fn new() -> Self {
        Self::with_interfaces(Arc::new(SystemInterfaces))
    }

    pub fn with_interfaces(interfaces: Arc<dyn InterfaceSource>) -> Self {
        Self { interfaces }
    }
}

impl ProbeHandler for TrafficSimHandler {
    fn spawn(&self, ctx: SessionContext) -> JoinHandle<()> {
        if ctx.probe.server {
            tokio::spawn(ServerSession::new(ctx, self.interfaces.clone()).run())
        } else {
            tokio::spawn(ClientSession::new(ctx, self.interfaces.clone()).run())
        }
    }
}

/// Aborts a helper task when the owning scope ends.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown: &mut ShutdownSignal) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn resolve_socket_addr(target: &str) -> Result<SocketAddr> {
    let target = target.trim();
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if port_of(target).is_none() {
        return Err(PathwatchError::Resolution(format!(
            "{} has no port",
            target
        )));
    }
    tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| PathwatchError::Resolution(format!("no address for {}", target)))
}
