// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Reconciles the pulled probe set against running sessions and owns
//! anomaly-triggered diagnostics.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::{
    AgentConfig, AgentId, Probe, ProbeId, ProbeResult, ProbeType, TargetAddr, host_of,
};

use super::registry::{HandlerRegistry, MeasureRequest};
use super::reporter::ResultReporter;
use super::session::{DiagnosticIntent, SessionContext};
use super::shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};

const DIAGNOSTIC_QUEUE: usize = 64;
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity of one running session: a probe fans out to one session per
/// resolved target; a TrafficSim server is keyed by its listen address.
/// An expanded AGENT probe shares its id across types, hence the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub probe_id: ProbeId,
    pub probe_type: ProbeType,
    pub server: bool,
    pub target: String,
}

/// A session the current probe set asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSession {
    pub key: SessionKey,
    pub probe: Probe,
    pub target_agent: AgentId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
    pub kept: usize,
    pub skipped: usize,
}

struct RunningSession {
    /// The probe with its targets cleared; a change restarts the session.
    fingerprint: Probe,
    handle: JoinHandle<()>,
    trigger: ShutdownTrigger,
}

fn fingerprint(probe: &Probe) -> Probe {
    let mut probe = probe.clone();
    probe.targets.clear();
    probe
}

/// Expand a probe set into the sessions it needs. The second value counts
/// targets that were skipped.
pub fn plan_sessions(probes: &[Probe]) -> (Vec<PlannedSession>, usize) {
    let mut planned = BTreeMap::new();
    let mut skipped = 0;

    for probe in probes {
        if !probe.enabled {
            continue;
        }
        if probe.probe_type == ProbeType::Agent {
            tracing::debug!(
                "[Dispatcher] Probe {} is an unexpanded AGENT probe, skipping",
                probe.id
            );
            skipped += 1;
            continue;
        }

        if probe.is_trafficsim_server() {
            match probe.listen_address() {
                Some(listen) => {
                    let key = SessionKey {
                        probe_id: probe.id,
                        probe_type: probe.probe_type,
                        server: true,
                        target: listen.to_string(),
                    };
                    planned.insert(
                        key.clone(),
                        PlannedSession {
                            key,
                            probe: probe.clone(),
                            target_agent: AgentId::NONE,
                        },
                    );
                }
                None => {
                    tracing::warn!(
                        "[Dispatcher] TrafficSim server probe {} has no listen address",
                        probe.id
                    );
                    skipped += 1;
                }
            }
            continue;
        }

        for target in &probe.targets {
            match target.classify() {
                TargetAddr::Literal(addr) => {
                    let key = SessionKey {
                        probe_id: probe.id,
                        probe_type: probe.probe_type,
                        server: false,
                        target: addr,
                    };
                    planned.insert(
                        key.clone(),
                        PlannedSession {
                            key,
                            probe: probe.clone(),
                            target_agent: target.agent.unwrap_or(AgentId::NONE),
                        },
                    );
                }
                TargetAddr::BidirAnchor(ip) => {
                    tracing::trace!(
                        "[Dispatcher] Probe {} anchors reverse path from {}",
                        probe.id,
                        ip
                    );
                }
                TargetAddr::Unresolved => {
                    tracing::warn!(
                        "[Dispatcher] Probe {} has an unresolved target, not starting",
                        probe.id
                    );
                    skipped += 1;
                }
            }
        }
    }

    (planned.into_values().collect(), skipped)
}

pub struct Dispatcher {
    agent_id: AgentId,
    config: Arc<AgentConfig>,
    registry: Arc<HandlerRegistry>,
    results: ResultReporter,
    sessions: HashMap<SessionKey, RunningSession>,
    probes_tx: watch::Sender<Arc<Vec<Probe>>>,
    diagnostics_tx: mpsc::Sender<DiagnosticIntent>,
    diagnostics_rx: mpsc::Receiver<DiagnosticIntent>,
    /// One diagnostic at a time per probe and target host. A server probe
    /// reports every unanchored peer under its own id.
    running_diagnostics: HashMap<(ProbeId, String), JoinHandle<()>>,
    /// Reapers for sessions being stopped.
    stopping: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        agent_id: AgentId,
        config: Arc<AgentConfig>,
        registry: Arc<HandlerRegistry>,
        results: ResultReporter,
    ) -> Self {
        let (probes_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (diagnostics_tx, diagnostics_rx) = mpsc::channel(DIAGNOSTIC_QUEUE);
        Self {
            agent_id,
            config,
            registry,
            results,
            sessions: HashMap::new(),
            probes_tx,
            diagnostics_tx,
            diagnostics_rx,
            running_diagnostics: HashMap::new(),
            stopping: Vec::new(),
        }
    }

    /// Latest probe set, as seen by running sessions.
    pub fn probe_set(&self) -> watch::Receiver<Arc<Vec<Probe>>> {
        self.probes_tx.subscribe()
    }

    pub fn diagnostics_sender(&self) -> mpsc::Sender<DiagnosticIntent> {
        self.diagnostics_tx.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn reconcile(&mut self, probes: Vec<Probe>) -> ReconcileSummary {
        let probes = Arc::new(probes);
        self.probes_tx.send_replace(probes.clone());

        let mut summary = ReconcileSummary::default();
        let (planned, skipped) = plan_sessions(&probes);
        summary.skipped = skipped;

        self.sessions.retain(|key, session| {
            if session.handle.is_finished() {
                tracing::info!(
                    "[Dispatcher] Session {} -> {} exited, pruning",
                    key.probe_id,
                    key.target
                );
                false
            } else {
                true
            }
        });
        self.stopping.retain(|reaper| !reaper.is_finished());

        let wanted: HashMap<&SessionKey, &PlannedSession> =
            planned.iter().map(|p| (&p.key, p)).collect();
        let stale: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(key, session)| match wanted.get(key) {
                None => true,
                Some(plan) => session.fingerprint != fingerprint(&plan.probe),
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut restarting = HashSet::new();
        for key in stale {
            if wanted.contains_key(&key) {
                restarting.insert(key.clone());
            } else {
                summary.stopped += 1;
            }
            self.stop_session(&key);
        }

        for plan in &planned {
            if self.sessions.contains_key(&plan.key) {
                summary.kept += 1;
                continue;
            }
            if !self.start_session(plan) {
                summary.skipped += 1;
            } else if restarting.contains(&plan.key) {
                summary.restarted += 1;
            } else {
                summary.started += 1;
            }
        }

        tracing::debug!(
            "[Dispatcher] Reconciled: {} started, {} restarted, {} stopped, {} kept, {} skipped",
            summary.started,
            summary.restarted,
            summary.stopped,
            summary.kept,
            summary.skipped
        );
        summary
    }

    fn start_session(&mut self, plan: &PlannedSession) -> bool {
        let Some(handler) = self.registry.get(plan.probe.probe_type) else {
            tracing::warn!(
                "[Dispatcher] No handler registered for {}, skipping probe {}",
                plan.probe.probe_type,
                plan.probe.id
            );
            return false;
        };

        let (trigger, signal) = shutdown_channel();
        let ctx = SessionContext {
            agent_id: self.agent_id,
            probe: plan.probe.clone(),
            target: plan.key.target.clone(),
            target_agent: plan.target_agent,
            config: self.config.clone(),
            results: self.results.clone(),
            diagnostics: self.diagnostics_tx.clone(),
            probe_set: self.probes_tx.subscribe(),
            shutdown: signal,
        };
        tracing::info!(
            "[Dispatcher] Starting {} session for probe {} -> {}",
            plan.probe.probe_type,
            plan.probe.id,
            plan.key.target
        );
        let handle = handler.spawn(ctx);
        self.sessions.insert(
            plan.key.clone(),
            RunningSession {
                fingerprint: fingerprint(&plan.probe),
                handle,
                trigger,
            },
        );
        true
    }

    /// Signal a session to stop; it is aborted if it outlives the graceful
    /// shutdown window.
    fn stop_session(&mut self, key: &SessionKey) {
        let Some(session) = self.sessions.remove(key) else {
            return;
        };
        tracing::info!(
            "[Dispatcher] Stopping session for probe {} -> {}",
            key.probe_id,
            key.target
        );
        session.trigger.trigger();
        self.stopping
            .push(reap(session, self.config.graceful_shutdown(), key.clone()));
    }

    pub fn handle_intent(&mut self, intent: DiagnosticIntent) {
        self.running_diagnostics
            .retain(|_, handle| !handle.is_finished());
        let slot = (intent.probe_id, host_of(&intent.target).to_string());
        if self.running_diagnostics.contains_key(&slot) {
            tracing::debug!(
                "[Dispatcher] Diagnostic for probe {} towards {} still running, ignoring {}",
                intent.probe_id,
                slot.1,
                intent.reason
            );
            return;
        }
        let Some(measurement) = self.registry.diagnostic() else {
            tracing::warn!("[Dispatcher] No diagnostic handler registered");
            return;
        };

        let request = MeasureRequest {
            host: slot.1.clone(),
            count: self.config.diagnostics.mtr_count,
            timeout: DIAGNOSTIC_TIMEOUT,
        };
        let reason = intent.reason.tag();
        tracing::info!(
            "[Dispatcher] Running diagnostic for probe {} towards {} ({})",
            intent.probe_id,
            request.host,
            reason
        );

        let results = self.results.clone();
        let handle = tokio::spawn(async move {
            let target = request.host.clone();
            match measurement.measure(request).await {
                Ok(payload) => {
                    results.report(
                        ProbeResult::new(
                            intent.probe_id,
                            ProbeType::Mtr,
                            target,
                            intent.target_agent,
                            payload,
                        )
                        .triggered_by(reason),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "[Dispatcher] Diagnostic for probe {} failed: {}",
                        intent.probe_id,
                        e
                    );
                }
            }
        });
        self.running_diagnostics.insert(slot, handle);
    }

    pub fn running_diagnostics(&self) -> usize {
        self.running_diagnostics
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Drive the dispatcher until shutdown or until the probe feed closes.
    pub async fn run(
        mut self,
        mut probes: mpsc::Receiver<Vec<Probe>>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                set = probes.recv() => match set {
                    Some(set) => {
                        self.reconcile(set);
                    }
                    None => break,
                },
                Some(intent) = self.diagnostics_rx.recv() => {
                    self.handle_intent(intent);
                }
            }
        }
        self.shutdown_all().await;
    }

    /// Stop every session and diagnostic, waiting up to the graceful window.
    pub async fn shutdown_all(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in &keys {
            self.stop_session(key);
        }
        for (_, handle) in self.running_diagnostics.drain() {
            handle.abort();
        }
        for reaper in self.stopping.drain(..) {
            let _ = reaper.await;
        }
        tracing::info!("[Dispatcher] All sessions stopped");
    }
}

fn reap(session: RunningSession, grace: Duration, key: SessionKey) -> JoinHandle<()> {
    let RunningSession { handle, trigger, .. } = session;
    tokio::spawn(async move {
        let abort = handle.abort_handle();
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!(
                "[Dispatcher] Session for probe {} -> {} did not stop in {:?}, aborting",
                key.probe_id,
                key.target,
                grace
            );
            abort.abort();
        }
        drop(trigger);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::registry::{Measurement, ProbeHandler};
    use crate::core::{ProbeTarget, Result};
    use crate::trafficsim::AnomalyReason;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const SELF_ID: AgentId = AgentId(1);

    /// Counts spawns; sessions idle until told to stop.
    #[derive(Default)]
    struct FakeHandler {
        spawned: AtomicUsize,
        exit_immediately: bool,
    }

    impl ProbeHandler for FakeHandler {
        fn spawn(&self, ctx: SessionContext) -> JoinHandle<()> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let exit = self.exit_immediately;
            tokio::spawn(async move {
                if exit {
                    return;
                }
                let mut shutdown = ctx.shutdown.clone();
                shutdown.wait().await;
            })
        }
    }

    struct BlockingMeasurement {
        calls: Arc<AtomicUsize>,
        release: Arc<Notify>,
    }

    impl Measurement for BlockingMeasurement {
        fn measure(&self, request: MeasureRequest) -> BoxFuture<'static, Result<serde_json::Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let release = self.release.clone();
            Box::pin(async move {
                release.notified().await;
                Ok(serde_json::json!({ "host": request.host, "count": request.count }))
            })
        }
    }

    fn dispatcher(handler: Arc<FakeHandler>) -> (Dispatcher, mpsc::Receiver<ProbeResult>) {
        let registry = HandlerRegistry::new();
        registry.register(ProbeType::Ping, handler.clone());
        registry.register(ProbeType::TrafficSim, handler);
        let (results, rx) = ResultReporter::channel(16);
        let config = AgentConfig {
            graceful_shutdown_ms: 200,
            ..AgentConfig::default()
        };
        (
            Dispatcher::new(SELF_ID, Arc::new(config), Arc::new(registry), results),
            rx,
        )
    }

    fn ping(id: u64, targets: &[&str]) -> Probe {
        Probe::new(ProbeId(id), SELF_ID, ProbeType::Ping).with_targets(
            targets.iter().map(|t| ProbeTarget::literal(*t)).collect(),
        )
    }

    #[test]
    fn test_plan_skips_unresolved_anchor_and_disabled() {
        let mut disabled = ping(3, &["10.0.0.3"]);
        disabled.enabled = false;
        let client = Probe::new(ProbeId(4), SELF_ID, ProbeType::TrafficSim).with_targets(vec![
            ProbeTarget::agent(AgentId(9)),
            ProbeTarget::bidir_anchor("198.51.100.7", AgentId(9)),
        ]);
        let mut server = Probe::new(ProbeId(5), SELF_ID, ProbeType::TrafficSim)
            .with_targets(vec![ProbeTarget::literal("0.0.0.0:5000")]);
        server.server = true;

        let (planned, skipped) = plan_sessions(&[ping(2, &["10.0.0.2"]), disabled, client, server]);
        let keys: Vec<_> = planned.iter().map(|p| (p.key.probe_id, p.key.target.as_str())).collect();
        assert_eq!(
            keys,
            vec![(ProbeId(2), "10.0.0.2"), (ProbeId(5), "0.0.0.0:5000")]
        );
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_restarts_and_stops() {
        let handler = Arc::new(FakeHandler::default());
        let (mut dispatcher, _rx) = dispatcher(handler.clone());

        let summary = dispatcher.reconcile(vec![ping(1, &["10.0.0.1", "10.0.0.2"])]);
        assert_eq!(summary.started, 2);
        assert_eq!(dispatcher.session_count(), 2);

        let summary = dispatcher.reconcile(vec![ping(1, &["10.0.0.1", "10.0.0.2"])]);
        assert_eq!(summary.kept, 2);
        assert_eq!(handler.spawned.load(Ordering::SeqCst), 2);

        let mut changed = ping(1, &["10.0.0.1"]);
        changed.interval = 30;
        let summary = dispatcher.reconcile(vec![changed]);
        assert_eq!(summary.restarted, 1);
        assert_eq!(summary.stopped, 1);
        assert_eq!(
            dispatcher.session_keys(),
            vec![SessionKey {
                probe_id: ProbeId(1),
                probe_type: ProbeType::Ping,
                server: false,
                target: "10.0.0.1".into()
            }]
        );

        let summary = dispatcher.reconcile(Vec::new());
        assert_eq!(summary.stopped, 1);
        assert_eq!(dispatcher.session_count(), 0);
        dispatcher.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_exited_session_is_restarted() {
        let handler = Arc::new(FakeHandler {
            exit_immediately: true,
            ..FakeHandler::default()
        });
        let (mut dispatcher, _rx) = dispatcher(handler.clone());
        dispatcher.reconcile(vec![ping(1, &["10.0.0.1"])]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = dispatcher.reconcile(vec![ping(1, &["10.0.0.1"])]);
        assert_eq!(summary.started, 1);
        assert_eq!(handler.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_set_is_published() {
        let (mut dispatcher, _rx) = dispatcher(Arc::new(FakeHandler::default()));
        let watcher = dispatcher.probe_set();
        dispatcher.reconcile(vec![ping(7, &["10.0.0.7"])]);
        assert_eq!(watcher.borrow()[0].id, ProbeId(7));
        dispatcher.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_diagnostic_is_rate_limited_per_probe() {
        let (mut dispatcher, mut rx) = dispatcher(Arc::new(FakeHandler::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        dispatcher.registry.set_diagnostic(Arc::new(BlockingMeasurement {
            calls: calls.clone(),
            release: release.clone(),
        }));

        let intent = DiagnosticIntent {
            probe_id: ProbeId(4),
            target: "198.51.100.7".into(),
            target_agent: AgentId(9),
            reason: AnomalyReason::PacketLoss { pct: 12.5 },
        };
        dispatcher.handle_intent(intent.clone());
        dispatcher.handle_intent(intent);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.running_diagnostics(), 1);

        release.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.probe_type, ProbeType::Mtr);
        assert!(result.triggered);
        assert_eq!(result.triggered_reason, "packet_loss:12.50%");
        assert_eq!(result.target_agent, AgentId(9));
        assert_eq!(result.payload["count"], 10);
    }

    #[tokio::test]
    async fn test_diagnostics_for_different_targets_run_side_by_side() {
        let (mut dispatcher, mut rx) = dispatcher(Arc::new(FakeHandler::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        dispatcher.registry.set_diagnostic(Arc::new(BlockingMeasurement {
            calls: calls.clone(),
            release: release.clone(),
        }));

        let towards = |target: &str, agent: u64| DiagnosticIntent {
            probe_id: ProbeId(100),
            target: target.into(),
            target_agent: AgentId(agent),
            reason: AnomalyReason::PacketLoss { pct: 40.0 },
        };
        dispatcher.handle_intent(towards("192.0.2.10", 2));
        dispatcher.handle_intent(towards("192.0.2.11", 3));
        dispatcher.handle_intent(towards("192.0.2.11:5000", 3));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.running_diagnostics(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_waiters();
        let mut agents = Vec::new();
        for _ in 0..2 {
            let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            agents.push(result.target_agent);
        }
        agents.sort();
        assert_eq!(agents, vec![AgentId(2), AgentId(3)]);
    }
}
