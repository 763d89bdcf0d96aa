// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Client side of a TrafficSim flow: dial, handshake, stream DATA in cycles.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::agent::{DiagnosticIntent, SessionContext, ShutdownSignal};
use crate::core::{PathwatchError, Result, TrafficSimConfig, host_of};

use super::baseline::AnomalyDetector;
use super::cycle::{AckOutcome, CycleSummary, CycleWindow};
use super::interface::{InterfaceSelector, InterfaceSource, NetInterface};
use super::message::{MAX_DATAGRAM, Message, MessageKind};
use super::monitor::{InterfaceEvent, InterfaceMonitor};
use super::report::{CycleReport, handshake_failure_stats};
use super::state::{ConnectionState, StateMachine};
use super::stats::{FlowDirection, FlowStats, ReceiveCounters};
use super::{AbortOnDrop, pause, resolve_socket_addr};

enum HandshakeOutcome {
    Accepted,
    Exhausted { attempts: u64, elapsed: Duration },
    Shutdown,
}

enum ActiveExit {
    Shutdown,
    Rehandshake,
    InterfaceLost,
}

/// Addresses a report is labelled with.
struct Endpoints {
    local: String,
    remote: String,
    interface: String,
}

pub struct ClientSession {
    ctx: SessionContext,
    config: TrafficSimConfig,
    interfaces: Arc<dyn InterfaceSource>,
    selector: InterfaceSelector,
    state: StateMachine,
    detector: AnomalyDetector,
    next_seq: u64,
}

impl ClientSession {
    pub fn new(ctx: SessionContext, interfaces: Arc<dyn InterfaceSource>) -> Self {
        let config = ctx.config.trafficsim.for_probe(&ctx.probe);
        Self {
            detector: AnomalyDetector::new(config.baseline_cycles),
            ctx,
            config,
            interfaces,
            selector: InterfaceSelector::new(),
            state: StateMachine::new(),
            next_seq: 0,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn run(mut self) {
        let probe_id = self.ctx.probe.id;
        tracing::info!(
            "[TrafficSim] Client for probe {} starting towards {}",
            probe_id,
            self.ctx.target
        );
        if let Err(e) = self.run_inner().await {
            tracing::warn!("[TrafficSim] Client for probe {} ended: {}", probe_id, e);
        }
        self.state.stop();
        tracing::info!("[TrafficSim] Client for probe {} stopped", probe_id);
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.clone();

        'select: loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            self.state.transition(ConnectionState::InterfaceSelect)?;

            let remote = match resolve_socket_addr(&self.ctx.target).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!("[TrafficSim] Cannot resolve {}: {}", self.ctx.target, e);
                    self.state.transition(ConnectionState::Degraded)?;
                    if !pause(self.config.handshake_budget(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue 'select;
                }
            };
            let iface = match self.select_interface(remote.ip()) {
                Ok(iface) => iface,
                Err(e) => {
                    tracing::warn!("[TrafficSim] Probe {}: {}", self.ctx.probe.id, e);
                    self.state.transition(ConnectionState::Degraded)?;
                    if !pause(self.config.handshake_retry(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue 'select;
                }
            };

            'connect: loop {
                self.state.transition(ConnectionState::Connecting)?;
                let socket = match bind_connected(iface.addr, remote).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::warn!(
                            "[TrafficSim] Cannot open socket on {} ({}): {}",
                            iface.name,
                            iface.addr,
                            e
                        );
                        self.state.transition(ConnectionState::Degraded)?;
                        if !pause(self.config.handshake_retry(), &mut shutdown).await {
                            return Ok(());
                        }
                        continue 'select;
                    }
                };

                let endpoints = Endpoints {
                    local: socket.local_addr()?.to_string(),
                    remote: remote.to_string(),
                    interface: iface.name.clone(),
                };

                self.state.transition(ConnectionState::Handshaking)?;
                match self.handshake(&socket, &mut shutdown).await? {
                    HandshakeOutcome::Accepted => {}
                    HandshakeOutcome::Exhausted { attempts, elapsed } => {
                        tracing::warn!(
                            "[TrafficSim] No ACK from {} after {} HELLO(s)",
                            remote,
                            attempts
                        );
                        self.state.transition(ConnectionState::Degraded)?;
                        self.report_handshake_failure(&endpoints, attempts, elapsed)?;
                        if !pause(self.config.handshake_retry(), &mut shutdown).await {
                            return Ok(());
                        }
                        continue 'connect;
                    }
                    HandshakeOutcome::Shutdown => return Ok(()),
                }

                self.state.transition(ConnectionState::Active)?;
                self.selector.mark_good(&iface.name);
                tracing::info!(
                    "[TrafficSim] Probe {} active {} -> {} via {}",
                    self.ctx.probe.id,
                    endpoints.local,
                    endpoints.remote,
                    endpoints.interface
                );

                match self
                    .run_active(Arc::new(socket), &iface, &endpoints, &mut shutdown)
                    .await?
                {
                    ActiveExit::Shutdown => return Ok(()),
                    ActiveExit::Rehandshake => continue 'connect,
                    ActiveExit::InterfaceLost => {
                        self.selector.forget();
                        continue 'select;
                    }
                }
            }
        }
    }

    fn select_interface(&mut self, target: IpAddr) -> Result<NetInterface> {
        let candidates = self.interfaces.interfaces()?;
        let chosen = self.selector.select(&candidates, target).ok_or_else(|| {
            PathwatchError::Transport(format!("no usable interface towards {}", target))
        })?;
        tracing::debug!(
            "[TrafficSim] Selected {} ({}) towards {}",
            chosen.name,
            chosen.addr,
            target
        );
        Ok(chosen)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn handshake(
        &mut self,
        socket: &UdpSocket,
        shutdown: &mut ShutdownSignal,
    ) -> Result<HandshakeOutcome> {
        let started = tokio::time::Instant::now();
        let budget = self.config.handshake_budget();
        let mut attempts = 0u64;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while started.elapsed() < budget {
            attempts += 1;
            let attempt_at = tokio::time::Instant::now();
            let seq = self.take_seq();
            let hello = Message::hello(self.ctx.agent_id, self.ctx.target_agent, seq);
            if let Err(e) = socket.send(&hello.encode()?).await {
                tracing::debug!("[TrafficSim] HELLO send failed: {}", e);
            }

            let deadline = attempt_at + self.config.packet_timeout();
            loop {
                let received = tokio::select! {
                    _ = shutdown.wait() => return Ok(HandshakeOutcome::Shutdown),
                    r = tokio::time::timeout_at(deadline, socket.recv(&mut buf)) => r,
                };
                match received {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        tracing::trace!("[TrafficSim] Handshake receive error: {}", e);
                        break;
                    }
                    Ok(Ok(n)) => match Message::decode(&buf[..n]) {
                        Ok(msg) if msg.kind == MessageKind::Ack && msg.seq == seq => {
                            return Ok(HandshakeOutcome::Accepted);
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::trace!("[TrafficSim] Dropping malformed datagram: {}", e);
                            continue;
                        }
                    },
                }
            }

            let next_attempt = attempt_at + self.config.handshake_retry();
            tokio::select! {
                _ = shutdown.wait() => return Ok(HandshakeOutcome::Shutdown),
                _ = tokio::time::sleep_until(next_attempt) => {}
            }
        }

        Ok(HandshakeOutcome::Exhausted {
            attempts,
            elapsed: started.elapsed(),
        })
    }

    async fn run_active(
        &mut self,
        socket: Arc<UdpSocket>,
        iface: &NetInterface,
        endpoints: &Endpoints,
        shutdown: &mut ShutdownSignal,
    ) -> Result<ActiveExit> {
        let window = Arc::new(Mutex::new(CycleWindow::new(
            self.config.report_seq,
            self.config.packet_timeout(),
            self.config.hard_cycle_timeout(),
        )));
        let server_view: Arc<Mutex<Option<ReceiveCounters>>> = Arc::new(Mutex::new(None));
        let ack_seen = Arc::new(AtomicBool::new(false));

        let _receiver = AbortOnDrop(tokio::spawn(receive_loop(
            socket.clone(),
            window.clone(),
            server_view.clone(),
            ack_seen.clone(),
            self.ctx.agent_id,
        )));

        let (iface_tx, mut iface_rx) = mpsc::channel(4);
        let _monitor = AbortOnDrop(
            InterfaceMonitor::new(self.interfaces.clone(), self.config.monitor_interval()).spawn(
                iface.clone(),
                iface_tx,
                shutdown.clone(),
            ),
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut degraded_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let pending = window.lock().flush(Instant::now());
                    self.emit_all(pending, endpoints, &server_view)?;
                    return Ok(ActiveExit::Shutdown);
                }
                Some(event) = iface_rx.recv() => {
                    if let InterfaceEvent::AddressLost { .. } = event {
                        self.state.transition(ConnectionState::Degraded)?;
                        let pending = window.lock().flush(Instant::now());
                        self.emit_all(pending, endpoints, &server_view)?;
                        return Ok(ActiveExit::InterfaceLost);
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if ack_seen.swap(false, Ordering::AcqRel)
                && self.state.current() == ConnectionState::Degraded
            {
                self.state.transition(ConnectionState::Active)?;
                degraded_since = None;
                tracing::info!("[TrafficSim] Probe {} recovered", self.ctx.probe.id);
            }

            let seq = self.take_seq();
            let data = Message::data(
                self.ctx.agent_id,
                self.ctx.target_agent,
                seq,
                self.config.payload_size,
            )
            .encode()?;
            if let Err(e) = socket.send(&data).await {
                tracing::trace!("[TrafficSim] DATA send failed: {}", e);
            }

            let closed = {
                let mut window = window.lock();
                let mut closed = window.record_sent(seq, data.len(), now);
                closed.extend(window.poll(now));
                closed
            };
            for summary in closed {
                let stats = self.emit_cycle(summary, endpoints, &server_view)?;
                if stats.packets_sent > 0
                    && stats.packets_received == 0
                    && self.state.current() == ConnectionState::Active
                {
                    tracing::warn!(
                        "[TrafficSim] Probe {} cycle {} received nothing",
                        self.ctx.probe.id,
                        stats.cycle
                    );
                    self.state.transition(ConnectionState::Degraded)?;
                    degraded_since = Some(now);
                }
            }

            if degraded_since
                .is_some_and(|since| now.duration_since(since) >= self.config.handshake_budget())
            {
                tracing::warn!(
                    "[TrafficSim] Probe {} degraded too long, re-handshaking",
                    self.ctx.probe.id
                );
                let pending = window.lock().flush(now);
                self.emit_all(pending, endpoints, &server_view)?;
                return Ok(ActiveExit::Rehandshake);
            }
        }
    }

    fn emit_all(
        &mut self,
        summaries: Vec<CycleSummary>,
        endpoints: &Endpoints,
        server_view: &Mutex<Option<ReceiveCounters>>,
    ) -> Result<()> {
        for summary in summaries {
            self.emit_cycle(summary, endpoints, server_view)?;
        }
        Ok(())
    }

    fn emit_cycle(
        &mut self,
        summary: CycleSummary,
        endpoints: &Endpoints,
        server_view: &Mutex<Option<ReceiveCounters>>,
    ) -> Result<FlowStats> {
        let stats = FlowStats::from_summary(FlowDirection::ClientToServer, &summary);
        let anomaly = self.detector.evaluate(&stats);

        tracing::debug!(
            "[TrafficSim] Probe {} cycle {}: sent {} recv {} loss {:.2}% rtt {:.2}ms",
            self.ctx.probe.id,
            stats.cycle,
            stats.packets_sent,
            stats.packets_received,
            stats.loss_percentage,
            stats.rtt.mean
        );

        let report = CycleReport {
            state: self.state.current(),
            local_addr: endpoints.local.clone(),
            remote_addr: endpoints.remote.clone(),
            interface: endpoints.interface.clone(),
            stats: stats.clone(),
            receive: server_view.lock().take(),
            baseline: self.detector.baseline().frozen(),
        };
        self.ctx.report(report.into_result(
            self.ctx.probe.id,
            &self.ctx.target,
            self.ctx.target_agent,
        )?);

        if let Some(reason) = anomaly {
            self.ctx.request_diagnostic(DiagnosticIntent {
                probe_id: self.ctx.probe.id,
                target: host_of(&self.ctx.target).to_string(),
                target_agent: self.ctx.target_agent,
                reason,
            });
        }
        Ok(stats)
    }

    fn report_handshake_failure(
        &mut self,
        endpoints: &Endpoints,
        attempts: u64,
        elapsed: Duration,
    ) -> Result<()> {
        let report = CycleReport {
            state: ConnectionState::Degraded,
            local_addr: endpoints.local.clone(),
            remote_addr: endpoints.remote.clone(),
            interface: endpoints.interface.clone(),
            stats: handshake_failure_stats(attempts, elapsed),
            receive: None,
            baseline: self.detector.baseline().frozen(),
        };
        self.ctx.report(report.into_result(
            self.ctx.probe.id,
            &self.ctx.target,
            self.ctx.target_agent,
        )?);
        Ok(())
    }
}

async fn bind_connected(local: IpAddr, remote: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    window: Arc<Mutex<CycleWindow>>,
    server_view: Arc<Mutex<Option<ReceiveCounters>>>,
    ack_seen: Arc<AtomicBool>,
    agent_id: crate::core::AgentId,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // Connected UDP sockets surface ICMP unreachable here.
                tracing::trace!("[TrafficSim] Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let msg = match Message::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::trace!("[TrafficSim] Dropping malformed datagram: {}", e);
                continue;
            }
        };

        match msg.kind {
            MessageKind::Ack => {
                let outcome = window.lock().record_ack(msg.seq, Instant::now());
                match outcome {
                    AckOutcome::Accepted { .. } => ack_seen.store(true, Ordering::Release),
                    other => tracing::trace!("[TrafficSim] ACK {} {:?}", msg.seq, other),
                }
            }
            MessageKind::Ping => {
                if let Ok(pong) = msg.reply(MessageKind::Pong, agent_id).encode() {
                    if let Err(e) = socket.send(&pong).await {
                        tracing::trace!("[TrafficSim] PONG send failed: {}", e);
                    }
                }
            }
            MessageKind::Report => match msg.report_counters() {
                Ok(counters) => *server_view.lock() = Some(counters),
                Err(e) => tracing::trace!("[TrafficSim] Bad REPORT: {}", e),
            },
            MessageKind::Hello | MessageKind::Data | MessageKind::Pong => {
                tracing::trace!("[TrafficSim] Ignoring {:?} from server", msg.kind);
            }
        }
    }
}
