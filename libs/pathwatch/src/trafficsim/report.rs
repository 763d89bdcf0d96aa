// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! TrafficSim cycle report payload.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{AgentId, ProbeId, ProbeResult, ProbeType, Result};

use super::baseline::FrozenBaseline;
use super::cycle::CycleSummary;
use super::state::ConnectionState;
use super::stats::{FlowDirection, FlowStats, ReceiveCounters};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub state: ConnectionState,
    pub local_addr: String,
    pub remote_addr: String,
    #[serde(default)]
    pub interface: String,
    #[serde(flatten)]
    pub stats: FlowStats,
    /// DATA receive counters: the server's view for a client report, the
    /// server's own counters for a reverse-path report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive: Option<ReceiveCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<FrozenBaseline>,
}

impl CycleReport {
    pub fn into_result(
        self,
        probe_id: ProbeId,
        target: &str,
        target_agent: AgentId,
    ) -> Result<ProbeResult> {
        let payload = serde_json::to_value(&self)?;
        Ok(ProbeResult::new(
            probe_id,
            ProbeType::TrafficSim,
            target,
            target_agent,
            payload,
        ))
    }
}

/// Stats for a failed handshake: every HELLO counts as sent and lost.
pub fn handshake_failure_stats(attempts: u64, elapsed: Duration) -> FlowStats {
    let now = Utc::now();
    let summary = CycleSummary {
        cycle: 0,
        start_seq: 0,
        end_seq: attempts.saturating_sub(1),
        started_at: now - chrono::Duration::from_std(elapsed).unwrap_or_default(),
        closed_at: now,
        duration: elapsed,
        packets_sent: attempts,
        packets_received: 0,
        packets_lost: attempts,
        in_flight: 0,
        duplicates: 0,
        out_of_sequence: 0,
        bytes_sent: 0,
        bytes_received: 0,
        rtts: Vec::new(),
    };
    FlowStats::from_summary(FlowDirection::ClientToServer, &summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_failure_is_full_loss() {
        let stats = handshake_failure_stats(15, Duration::from_secs(15));
        assert_eq!(stats.packets_sent, 15);
        assert_eq!(stats.loss_percentage, 100.0);
    }

    #[test]
    fn test_report_payload_is_flat() {
        let report = CycleReport {
            state: ConnectionState::Degraded,
            local_addr: "192.168.1.2:40000".into(),
            remote_addr: "198.51.100.7:5000".into(),
            interface: "eth0".into(),
            stats: handshake_failure_stats(3, Duration::from_secs(3)),
            receive: None,
            baseline: None,
        };
        let result = report
            .into_result(ProbeId(4), "198.51.100.7:5000", AgentId(2))
            .unwrap();
        assert_eq!(result.probe_type, ProbeType::TrafficSim);
        assert_eq!(result.payload["state"], "degraded");
        assert_eq!(result.payload["direction"], "client_to_server");
        assert_eq!(result.payload["loss_percentage"], 100.0);
        assert!(result.payload.get("receive").is_none());
    }
}
