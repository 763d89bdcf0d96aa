// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! What a running session gets handed by the dispatcher.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::core::{AgentConfig, AgentId, Probe, ProbeId, ProbeResult};
use crate::trafficsim::AnomalyReason;

use super::reporter::ResultReporter;
use super::shutdown::ShutdownSignal;

/// Request from a TrafficSim session for a one-shot diagnostic. Only the
/// dispatcher turns these into sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticIntent {
    /// Probe the diagnostic result is reported under.
    pub probe_id: ProbeId,
    /// Host to trace, without port.
    pub target: String,
    pub target_agent: AgentId,
    pub reason: AnomalyReason,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub agent_id: AgentId,
    pub probe: Probe,
    /// Resolved literal address, or the listen address for a server.
    pub target: String,
    pub target_agent: AgentId,
    pub config: Arc<AgentConfig>,
    pub results: ResultReporter,
    pub diagnostics: mpsc::Sender<DiagnosticIntent>,
    /// Latest probe set pulled from the controller.
    pub probe_set: watch::Receiver<Arc<Vec<Probe>>>,
    pub shutdown: ShutdownSignal,
}

impl SessionContext {
    pub fn report(&self, result: ProbeResult) -> bool {
        self.results.report(result)
    }

    pub fn request_diagnostic(&self, intent: DiagnosticIntent) {
        tracing::info!(
            "[TrafficSim] Anomaly on probe {} towards {}: {}",
            intent.probe_id,
            intent.target,
            intent.reason
        );
        if let Err(e) = self.diagnostics.try_send(intent) {
            tracing::debug!("[TrafficSim] Diagnostic request not queued: {}", e);
        }
    }
}
