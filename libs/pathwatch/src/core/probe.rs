// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Probe data model shared by the controller and agents.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, GroupId, ProbeId};

/// Suffix marking a non-dialed bidirectional anchor target (`"<ip>:bidir"`).
pub const BIDIR_MARKER: &str = "bidir";

/// Kind of measurement a probe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeType {
    Ping,
    Mtr,
    #[serde(rename = "TRAFFICSIM")]
    TrafficSim,
    /// Controller-side only; always expanded by the resolver.
    Agent,
}

impl ProbeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Ping => "PING",
            ProbeType::Mtr => "MTR",
            ProbeType::TrafficSim => "TRAFFICSIM",
            ProbeType::Agent => "AGENT",
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a probe's target list.
///
/// Exactly one of the three forms is meaningful at a time: a literal
/// `host[:port]`, an agent reference (left empty until resolved), or a group
/// reference (expanded by the resolver).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeTarget {
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
}

impl ProbeTarget {
    pub fn literal(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            agent: None,
            group: None,
        }
    }

    pub fn agent(agent: AgentId) -> Self {
        Self {
            target: String::new(),
            agent: Some(agent),
            group: None,
        }
    }

    pub fn group(group: GroupId) -> Self {
        Self {
            target: String::new(),
            agent: None,
            group: Some(group),
        }
    }

    /// Build the anchor marker for a reverse-direction peer.
    pub fn bidir_anchor(ip: &str, agent: AgentId) -> Self {
        Self {
            target: format!("{}:{}", ip, BIDIR_MARKER),
            agent: Some(agent),
            group: None,
        }
    }

    /// Classify the wire form as the dispatcher sees it.
    pub fn classify(&self) -> TargetAddr {
        let target = self.target.trim();
        if target.is_empty() {
            return TargetAddr::Unresolved;
        }
        if let Some(ip) = target
            .strip_suffix(BIDIR_MARKER)
            .and_then(|rest| rest.strip_suffix(':'))
        {
            return TargetAddr::BidirAnchor(ip.to_string());
        }
        TargetAddr::Literal(target.to_string())
    }

    pub fn is_bidir_anchor(&self) -> bool {
        matches!(self.classify(), TargetAddr::BidirAnchor(_))
    }
}

/// Agent-side interpretation of a [`ProbeTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Literal(String),
    BidirAnchor(String),
    Unresolved,
}

/// A configured monitoring check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub id: ProbeId,
    pub agent_id: AgentId,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Schedule period in seconds (one-shot types).
    #[serde(default)]
    pub interval: u64,
    /// Per-reply timeout in seconds; `0` means the configured default.
    #[serde(default)]
    pub timeout: u64,
    /// Packet count; for TrafficSim this overrides the cycle size when non-zero.
    #[serde(default)]
    pub count: u32,
    /// Measurement duration in seconds, where meaningful.
    #[serde(default)]
    pub duration: u64,
    /// TrafficSim only: listen instead of dial.
    #[serde(default)]
    pub server: bool,
    #[serde(default)]
    pub targets: Vec<ProbeTarget>,
}

fn default_enabled() -> bool {
    true
}

impl Probe {
    pub fn new(id: ProbeId, agent_id: AgentId, probe_type: ProbeType) -> Self {
        Self {
            id,
            agent_id,
            probe_type,
            enabled: true,
            interval: 0,
            timeout: 0,
            count: 0,
            duration: 0,
            server: false,
            targets: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: Vec<ProbeTarget>) -> Self {
        self.targets = targets;
        self
    }

    pub fn is_trafficsim_server(&self) -> bool {
        self.probe_type == ProbeType::TrafficSim && self.server
    }

    /// Listen address of a TrafficSim server probe (`targets[0]`).
    pub fn listen_address(&self) -> Option<&str> {
        if !self.is_trafficsim_server() {
            return None;
        }
        self.targets
            .first()
            .map(|t| t.target.trim())
            .filter(|t| !t.is_empty())
    }

    /// Port a TrafficSim server listens on.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_address().and_then(port_of)
    }

    /// Agents allowed to connect to this TrafficSim server.
    pub fn allowed_agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.targets
            .iter()
            .skip(usize::from(self.is_trafficsim_server()))
            .filter(|t| !t.is_bidir_anchor())
            .filter_map(|t| t.agent)
    }
}

/// Strip an optional `:port` suffix, handling bracketed IPv6 literals.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if addr.parse::<IpAddr>().is_ok() {
        return addr;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}

/// Extract the port from `host:port`, if any.
pub fn port_of(addr: &str) -> Option<u16> {
    let addr = addr.trim();
    if addr.parse::<IpAddr>().is_ok() {
        return None;
    }
    addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        _ => format!("{}:{}", host, port),
    }
}
