// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Control-plane frames exchanged over the agent WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AgentId, Probe, ProbeId, ProbeResult, Result};

/// Path the controller serves the agent channel on.
pub const AGENT_WS_PATH: &str = "/ws/agent";

/// A control-plane frame, serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ControlMessage {
    Auth { agent_id: AgentId, token: String },
    AuthOk { agent_id: AgentId },
    ProbeGet { agent_id: AgentId },
    ProbeGetOk { probes: Vec<Probe> },
    ProbePost(ProbeResult),
    ProbePostOk {
        probe_id: ProbeId,
        created_at: DateTime<Utc>,
    },
    Error { message: String },
}

impl ControlMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthOk { .. } => "auth_ok",
            ControlMessage::ProbeGet { .. } => "probe_get",
            ControlMessage::ProbeGetOk { .. } => "probe_get_ok",
            ControlMessage::ProbePost(_) => "probe_post",
            ControlMessage::ProbePostOk { .. } => "probe_post_ok",
            ControlMessage::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
