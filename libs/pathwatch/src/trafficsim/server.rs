// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Server side of TrafficSim: accept allowed peers, ACK their DATA and
//! measure the reverse path with PING/PONG.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::agent::{DiagnosticIntent, SessionContext, ShutdownSignal};
use crate::core::{AgentId, PathwatchError, Probe, ProbeId, ProbeType, Result, TrafficSimConfig};

use super::baseline::{AnomalyDetector, AnomalyReason, FrozenBaseline};
use super::cycle::CycleWindow;
use super::interface::{InterfaceSource, NetInterface};
use super::message::{MAX_DATAGRAM, Message, MessageKind};
use super::monitor::{InterfaceEvent, InterfaceMonitor};
use super::report::CycleReport;
use super::state::{ConnectionState, StateMachine};
use super::stats::{FlowDirection, FlowStats, ReceiveCounters};
use super::{AbortOnDrop, pause, resolve_socket_addr};

struct Peer {
    agent_id: AgentId,
    report_probe: ProbeId,
    last_seen: Instant,
    next_ping_seq: u64,
    pings: CycleWindow,
    receive: ReceiveCounters,
    detector: AnomalyDetector,
}

impl Peer {
    fn new(agent_id: AgentId, report_probe: ProbeId, config: &TrafficSimConfig, now: Instant) -> Self {
        Self {
            agent_id,
            report_probe,
            last_seen: now,
            next_ping_seq: 0,
            pings: CycleWindow::new(
                config.report_seq,
                config.packet_timeout(),
                config.hard_cycle_timeout(),
            ),
            receive: ReceiveCounters::default(),
            detector: AnomalyDetector::new(config.baseline_cycles),
        }
    }
}

/// A closed reverse-path cycle for one peer.
#[derive(Debug, Clone)]
pub struct PeerCycle {
    pub addr: SocketAddr,
    pub agent_id: AgentId,
    pub report_probe: ProbeId,
    pub stats: FlowStats,
    pub receive: ReceiveCounters,
    pub baseline: Option<FrozenBaseline>,
    pub anomaly: Option<AnomalyReason>,
}

/// Work produced by one PING tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub pings: Vec<(SocketAddr, Vec<u8>)>,
    pub cycles: Vec<PeerCycle>,
    pub expired: Vec<(SocketAddr, AgentId)>,
}

/// Accepted peers of one server session. Owned by the session, shared only
/// between its receive task and its PING loop.
pub struct PeerTable {
    local_agent: AgentId,
    server_probe: Probe,
    config: TrafficSimConfig,
    peers: HashMap<SocketAddr, Peer>,
}

impl PeerTable {
    pub fn new(local_agent: AgentId, server_probe: Probe, config: TrafficSimConfig) -> Self {
        Self {
            local_agent,
            server_probe,
            config,
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn report_probe(&self, addr: &SocketAddr) -> Option<ProbeId> {
        self.peers.get(addr).map(|p| p.report_probe)
    }

    /// Handle one inbound datagram and return the reply to send, if any.
    ///
    /// `probes` is the latest probe set, read for the allow-list and for
    /// bidirectional anchors.
    pub fn handle(
        &mut self,
        msg: &Message,
        from: SocketAddr,
        bytes: usize,
        probes: &[Probe],
        now: Instant,
    ) -> Option<Message> {
        match msg.kind {
            MessageKind::Hello => self.accept_hello(msg, from, probes, now),
            MessageKind::Data => {
                let peer = self
                    .peers
                    .get_mut(&from)
                    .filter(|p| p.agent_id == msg.src)?;
                peer.last_seen = now;
                peer.receive.observe(msg.seq, bytes);
                Some(msg.reply(MessageKind::Ack, self.local_agent))
            }
            MessageKind::Pong => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.last_seen = now;
                    peer.pings.record_ack(msg.seq, now);
                }
                None
            }
            MessageKind::Ack | MessageKind::Ping | MessageKind::Report => None,
        }
    }

    fn accept_hello(
        &mut self,
        msg: &Message,
        from: SocketAddr,
        probes: &[Probe],
        now: Instant,
    ) -> Option<Message> {
        let server = probes
            .iter()
            .find(|p| p.id == self.server_probe.id && p.is_trafficsim_server())
            .unwrap_or(&self.server_probe);
        if !server.allowed_agents().any(|a| a == msg.src) {
            tracing::trace!(
                "[TrafficSim] Dropping HELLO from agent {} at {}: not allowed",
                msg.src,
                from
            );
            return None;
        }

        let known = self.peers.get(&from).is_some_and(|p| p.agent_id == msg.src);
        if !known {
            let report_probe = anchor_probe_for(probes, msg.src).unwrap_or(self.server_probe.id);
            tracing::info!(
                "[TrafficSim] Accepted agent {} from {}, reporting under probe {}",
                msg.src,
                from,
                report_probe
            );
            self.peers
                .insert(from, Peer::new(msg.src, report_probe, &self.config, now));
        }
        let peer = self.peers.get_mut(&from)?;
        peer.last_seen = now;
        peer.receive.skip(msg.seq);
        Some(msg.reply(MessageKind::Ack, self.local_agent))
    }

    /// Queue one PING per live peer and close due cycles. Idle peers have
    /// their open cycles flushed before they are dropped.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let idle = self.config.peer_idle_timeout();
        let mut out = TickOutput::default();

        for (addr, peer) in self.peers.iter_mut() {
            if now.saturating_duration_since(peer.last_seen) >= idle {
                out.expired.push((*addr, peer.agent_id));
                for summary in peer.pings.flush(now) {
                    out.cycles.push(close_peer_cycle(*addr, peer, &summary));
                }
                continue;
            }

            let seq = peer.next_ping_seq;
            peer.next_ping_seq += 1;
            let Ok(bytes) = Message::ping(self.local_agent, peer.agent_id, seq).encode() else {
                continue;
            };
            let mut closed = peer.pings.record_sent(seq, bytes.len(), now);
            closed.extend(peer.pings.poll(now));
            out.pings.push((*addr, bytes));

            for summary in closed {
                out.cycles.push(close_peer_cycle(*addr, peer, &summary));
            }
        }

        for (addr, agent) in &out.expired {
            tracing::info!("[TrafficSim] Peer agent {} at {} went idle", agent, addr);
            self.peers.remove(addr);
        }
        out
    }

    /// Flush every peer's open cycles.
    pub fn drain(&mut self, now: Instant) -> Vec<PeerCycle> {
        let mut cycles = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            for summary in peer.pings.flush(now) {
                cycles.push(close_peer_cycle(*addr, peer, &summary));
            }
        }
        cycles
    }
}

fn close_peer_cycle(
    addr: SocketAddr,
    peer: &mut Peer,
    summary: &super::cycle::CycleSummary,
) -> PeerCycle {
    let stats = FlowStats::from_summary(FlowDirection::ServerToClient, summary);
    let anomaly = peer.detector.evaluate(&stats);
    PeerCycle {
        addr,
        agent_id: peer.agent_id,
        report_probe: peer.report_probe,
        receive: peer.receive.take(),
        baseline: peer.detector.baseline().frozen(),
        stats,
        anomaly,
    }
}

/// Probe id of the bidirectional anchor pointing at `agent`, if any.
fn anchor_probe_for(probes: &[Probe], agent: AgentId) -> Option<ProbeId> {
    probes
        .iter()
        .filter(|p| p.probe_type == ProbeType::TrafficSim && !p.server)
        .find(|p| {
            p.targets
                .iter()
                .any(|t| t.is_bidir_anchor() && t.agent == Some(agent))
        })
        .map(|p| p.id)
}

pub struct ServerSession {
    ctx: SessionContext,
    config: TrafficSimConfig,
    interfaces: Arc<dyn InterfaceSource>,
    state: StateMachine,
    table: Arc<Mutex<PeerTable>>,
}

impl ServerSession {
    pub fn new(ctx: SessionContext, interfaces: Arc<dyn InterfaceSource>) -> Self {
        let config = ctx.config.trafficsim.for_probe(&ctx.probe);
        let table = PeerTable::new(ctx.agent_id, ctx.probe.clone(), config.clone());
        Self {
            ctx,
            config,
            interfaces,
            state: StateMachine::new(),
            table: Arc::new(Mutex::new(table)),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn run(mut self) {
        let probe_id = self.ctx.probe.id;
        tracing::info!(
            "[TrafficSim] Server for probe {} starting on {}",
            probe_id,
            self.ctx.target
        );
        if let Err(e) = self.run_inner().await {
            tracing::warn!("[TrafficSim] Server for probe {} ended: {}", probe_id, e);
        }
        self.state.stop();
        tracing::info!("[TrafficSim] Server for probe {} stopped", probe_id);
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.clone();
        let listen = resolve_socket_addr(&self.ctx.target).await?;

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            self.state.transition(ConnectionState::InterfaceSelect)?;
            let iface = match self.bound_interface(&listen) {
                Ok(iface) => iface,
                Err(e) => {
                    tracing::warn!("[TrafficSim] Server for probe {}: {}", self.ctx.probe.id, e);
                    self.state.transition(ConnectionState::Degraded)?;
                    if !pause(self.config.handshake_retry(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.state.transition(ConnectionState::Connecting)?;
            let socket = match UdpSocket::bind(listen).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    tracing::warn!("[TrafficSim] Cannot bind {}: {}", listen, e);
                    self.state.transition(ConnectionState::Degraded)?;
                    if !pause(self.config.handshake_retry(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.state.transition(ConnectionState::Active)?;
            tracing::info!(
                "[TrafficSim] Server for probe {} listening on {}",
                self.ctx.probe.id,
                socket.local_addr()?
            );

            if self.serve(socket, iface, &mut shutdown).await? {
                return Ok(());
            }
            self.state.transition(ConnectionState::Degraded)?;
        }
    }

    /// The interface owning a specific listen address. `None` for a
    /// wildcard bind; an error while no local interface carries the address.
    fn bound_interface(&self, listen: &SocketAddr) -> Result<Option<NetInterface>> {
        if listen.ip().is_unspecified() {
            return Ok(None);
        }
        self.interfaces
            .interfaces()?
            .into_iter()
            .find(|i| i.addr == listen.ip() && i.is_up)
            .map(Some)
            .ok_or_else(|| {
                PathwatchError::Transport(format!("no local interface carries {}", listen.ip()))
            })
    }

    /// Serve until shutdown (`true`) or loss of the bound address (`false`).
    async fn serve(
        &mut self,
        socket: Arc<UdpSocket>,
        iface: Option<NetInterface>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<bool> {
        let local_addr = socket.local_addr()?.to_string();
        let iface_name = iface
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "any".to_string());

        let _receiver = AbortOnDrop(tokio::spawn(receive_loop(
            socket.clone(),
            self.table.clone(),
            self.ctx.probe_set.clone(),
        )));

        let (iface_tx, mut iface_rx) = mpsc::channel(4);
        let _monitor = iface.map(|iface| {
            AbortOnDrop(
                InterfaceMonitor::new(self.interfaces.clone(), self.config.monitor_interval())
                    .spawn(iface, iface_tx, shutdown.clone()),
            )
        });

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let cycles = self.table.lock().drain(Instant::now());
                    self.emit(&socket, &local_addr, &iface_name, cycles).await?;
                    return Ok(true);
                }
                Some(event) = iface_rx.recv() => {
                    if let InterfaceEvent::AddressLost { .. } = event {
                        let cycles = self.table.lock().drain(Instant::now());
                        self.emit(&socket, &local_addr, &iface_name, cycles).await?;
                        return Ok(false);
                    }
                }
                _ = ticker.tick() => {
                    let out = self.table.lock().tick(Instant::now());
                    for (addr, ping) in &out.pings {
                        if let Err(e) = socket.send_to(ping, addr).await {
                            tracing::trace!("[TrafficSim] PING to {} failed: {}", addr, e);
                        }
                    }
                    self.emit(&socket, &local_addr, &iface_name, out.cycles).await?;
                }
            }
        }
    }

    async fn emit(
        &self,
        socket: &UdpSocket,
        local_addr: &str,
        iface_name: &str,
        cycles: Vec<PeerCycle>,
    ) -> Result<()> {
        for cycle in cycles {
            let report_msg =
                Message::report(self.ctx.agent_id, cycle.agent_id, cycle.stats.cycle, &cycle.receive)?;
            if let Err(e) = socket.send_to(&report_msg.encode()?, cycle.addr).await {
                tracing::trace!("[TrafficSim] REPORT to {} failed: {}", cycle.addr, e);
            }

            let peer_host = cycle.addr.ip().to_string();
            tracing::debug!(
                "[TrafficSim] Probe {} reverse cycle {} for agent {}: loss {:.2}%",
                cycle.report_probe,
                cycle.stats.cycle,
                cycle.agent_id,
                cycle.stats.loss_percentage
            );

            let report = CycleReport {
                state: self.state.current(),
                local_addr: local_addr.to_string(),
                remote_addr: cycle.addr.to_string(),
                interface: iface_name.to_string(),
                stats: cycle.stats,
                receive: Some(cycle.receive),
                baseline: cycle.baseline,
            };
            self.ctx
                .report(report.into_result(cycle.report_probe, &peer_host, cycle.agent_id)?);

            if let Some(reason) = cycle.anomaly {
                self.ctx.request_diagnostic(DiagnosticIntent {
                    probe_id: cycle.report_probe,
                    target: peer_host,
                    target_agent: cycle.agent_id,
                    reason,
                });
            }
        }
        Ok(())
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<PeerTable>>,
    probe_set: watch::Receiver<Arc<Vec<Probe>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::trace!("[TrafficSim] Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let msg = match Message::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::trace!("[TrafficSim] Dropping malformed datagram from {}: {}", from, e);
                continue;
            }
        };

        let probes = probe_set.borrow().clone();
        let reply = table.lock().handle(&msg, from, n, &probes, Instant::now());
        if let Some(reply) = reply {
            match reply.encode() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, from).await {
                        tracing::trace!("[TrafficSim] Reply to {} failed: {}", from, e);
                    }
                }
                Err(e) => tracing::debug!("[TrafficSim] Cannot encode reply: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProbeTarget;
    use std::time::Duration;

    const SERVER: AgentId = AgentId(1);

    fn server_probe(allowed: &[u64]) -> Probe {
        let mut targets = vec![ProbeTarget::literal("0.0.0.0:5000")];
        targets.extend(allowed.iter().map(|a| ProbeTarget::agent(AgentId(*a))));
        Probe {
            server: true,
            ..Probe::new(ProbeId(100), SERVER, ProbeType::TrafficSim)
        }
        .with_targets(targets)
    }

    fn config() -> TrafficSimConfig {
        TrafficSimConfig {
            report_seq: 3,
            ..TrafficSimConfig::default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 10], port))
    }

    #[test]
    fn test_unauthorized_hello_is_dropped() {
        let probe = server_probe(&[2]);
        let mut table = PeerTable::new(SERVER, probe.clone(), config());
        let hello = Message::hello(AgentId(9), SERVER, 0);
        let reply = table.handle(&hello, addr(4000), 10, &[probe], Instant::now());
        assert!(reply.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_data_from_unknown_peer_gets_no_ack() {
        let probe = server_probe(&[2]);
        let mut table = PeerTable::new(SERVER, probe.clone(), config());
        let data = Message::data(AgentId(2), SERVER, 5, 8);
        assert!(table.handle(&data, addr(4000), 20, &[probe], Instant::now()).is_none());
    }

    #[test]
    fn test_allowed_peer_is_acked_and_tracked() {
        let probe = server_probe(&[2]);
        let probes = vec![probe.clone()];
        let mut table = PeerTable::new(SERVER, probe, config());
        let now = Instant::now();

        let ack = table
            .handle(&Message::hello(AgentId(2), SERVER, 0), addr(4000), 10, &probes, now)
            .unwrap();
        assert_eq!(ack.kind, MessageKind::Ack);
        assert_eq!(ack.seq, 0);
        assert_eq!(table.report_probe(&addr(4000)), Some(ProbeId(100)));

        let ack = table
            .handle(&Message::data(AgentId(2), SERVER, 1, 8), addr(4000), 20, &probes, now)
            .unwrap();
        assert_eq!(ack.seq, 1);
    }

    #[test]
    fn test_allow_list_refreshes_from_probe_set() {
        let started_with = server_probe(&[]);
        let mut table = PeerTable::new(SERVER, started_with, config());
        let hello = Message::hello(AgentId(3), SERVER, 0);
        assert!(table.handle(&hello, addr(4000), 10, &[], Instant::now()).is_none());

        let refreshed = vec![server_probe(&[3])];
        assert!(
            table
                .handle(&hello, addr(4000), 10, &refreshed, Instant::now())
                .is_some()
        );
    }

    #[test]
    fn test_bidir_anchor_selects_report_probe() {
        let probe = server_probe(&[2]);
        let anchor = Probe::new(ProbeId(77), SERVER, ProbeType::TrafficSim)
            .with_targets(vec![ProbeTarget::bidir_anchor("192.0.2.10", AgentId(2))]);
        let probes = vec![probe.clone(), anchor];
        let mut table = PeerTable::new(SERVER, probe, config());
        table.handle(
            &Message::hello(AgentId(2), SERVER, 0),
            addr(4000),
            10,
            &probes,
            Instant::now(),
        );
        assert_eq!(table.report_probe(&addr(4000)), Some(ProbeId(77)));
    }

    #[test]
    fn test_ping_cycle_closes_after_report_seq() {
        let probe = server_probe(&[2]);
        let probes = vec![probe.clone()];
        let mut table = PeerTable::new(SERVER, probe, config());
        let t0 = Instant::now();
        table.handle(&Message::hello(AgentId(2), SERVER, 0), addr(4000), 10, &probes, t0);
        table.handle(&Message::data(AgentId(2), SERVER, 1, 8), addr(4000), 20, &probes, t0);

        let mut cycles = Vec::new();
        for i in 0..3u64 {
            let at = t0 + Duration::from_millis(100 * i);
            let out = table.tick(at);
            assert_eq!(out.pings.len(), 1);
            let pong = Message::new(MessageKind::Pong, AgentId(2), SERVER, i);
            table.handle(&pong, addr(4000), 10, &probes, at + Duration::from_millis(5));
            cycles.extend(out.cycles);
        }
        cycles.extend(table.tick(t0 + Duration::from_millis(300)).cycles);

        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.stats.direction, FlowDirection::ServerToClient);
        assert_eq!(cycle.stats.packets_sent, 3);
        assert_eq!(cycle.stats.packets_received, 3);
        assert_eq!(cycle.receive.received, 1);
    }

    #[test]
    fn test_idle_peers_are_removed() {
        let probe = server_probe(&[2]);
        let probes = vec![probe.clone()];
        let mut table = PeerTable::new(SERVER, probe, config());
        let t0 = Instant::now();
        table.handle(&Message::hello(AgentId(2), SERVER, 0), addr(4000), 10, &probes, t0);
        let out = table.tick(t0 + Duration::from_secs(31));
        assert_eq!(out.expired, vec![(addr(4000), AgentId(2))]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_idle_peer_flushes_open_cycle() {
        let probe = server_probe(&[2]);
        let probes = vec![probe.clone()];
        let mut table = PeerTable::new(SERVER, probe, config());
        let t0 = Instant::now();
        table.handle(&Message::hello(AgentId(2), SERVER, 0), addr(4000), 10, &probes, t0);

        for i in 0..2u64 {
            let at = t0 + Duration::from_millis(100 * i);
            table.handle(&Message::data(AgentId(2), SERVER, i + 1, 8), addr(4000), 20, &probes, at);
            let out = table.tick(at);
            assert!(out.cycles.is_empty());
            let pong = Message::new(MessageKind::Pong, AgentId(2), SERVER, i);
            table.handle(&pong, addr(4000), 10, &probes, at + Duration::from_millis(5));
        }

        let out = table.tick(t0 + Duration::from_secs(40));
        assert_eq!(out.expired, vec![(addr(4000), AgentId(2))]);
        assert!(out.pings.is_empty());
        assert_eq!(out.cycles.len(), 1);
        let cycle = &out.cycles[0];
        assert_eq!(cycle.stats.packets_sent, 2);
        assert_eq!(cycle.stats.packets_received, 2);
        assert_eq!(cycle.receive.received, 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_rehandshake_does_not_count_gaps() {
        let probe = server_probe(&[2]);
        let probes = vec![probe.clone()];
        let mut table = PeerTable::new(SERVER, probe, config());
        let t0 = Instant::now();
        for (kind, seq) in [
            (MessageKind::Hello, 0),
            (MessageKind::Data, 1),
            (MessageKind::Data, 2),
            (MessageKind::Hello, 3),
            (MessageKind::Hello, 4),
            (MessageKind::Data, 5),
        ] {
            let msg = Message::new(kind, AgentId(2), SERVER, seq);
            assert!(table.handle(&msg, addr(4000), 20, &probes, t0).is_some());
        }

        table.tick(t0);
        let drained = table.drain(t0 + Duration::from_millis(10));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].receive.received, 3);
        assert_eq!(drained[0].receive.gaps, 0);
    }
}
