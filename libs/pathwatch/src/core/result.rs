// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Measurement results as pushed over `probe_post`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ProbeId};
use super::probe::ProbeType;

/// One completed measurement or cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_id: ProbeId,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    #[serde(default)]
    pub triggered: bool,
    /// Empty unless `triggered`.
    #[serde(default)]
    pub triggered_reason: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target: String,
    /// `0` when the target is not an agent.
    #[serde(default)]
    pub target_agent: AgentId,
}

impl ProbeResult {
    pub fn new(
        probe_id: ProbeId,
        probe_type: ProbeType,
        target: impl Into<String>,
        target_agent: AgentId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            probe_id,
            probe_type,
            triggered: false,
            triggered_reason: String::new(),
            created_at: Utc::now(),
            payload,
            target: target.into(),
            target_agent,
        }
    }

    /// Mark the result as produced by an anomaly-triggered diagnostic.
    pub fn triggered_by(mut self, reason: impl Into<String>) -> Self {
        self.triggered = true;
        self.triggered_reason = reason.into();
        self
    }
}

/// A result as stored by a result sink: keyed by
/// (probe id, reporting agent id, type, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub agent_id: AgentId,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: ProbeResult,
}

impl ResultRecord {
    pub fn key(&self) -> (ProbeId, AgentId, ProbeType, DateTime<Utc>) {
        (
            self.result.probe_id,
            self.agent_id,
            self.result.probe_type,
            self.result.created_at,
        )
    }
}
