// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Agent and controller configuration loaded from YAML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::AgentId;
use super::probe::Probe;
use super::{PathwatchError, Result};

/// Get the pathwatch home directory.
///
/// Resolution order:
/// 1. `PATHWATCH_HOME` environment variable
/// 2. `~/.pathwatch`
/// 3. `./.pathwatch` when no home directory can be determined
pub fn pathwatch_home() -> PathBuf {
    if let Ok(home) = std::env::var("PATHWATCH_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".pathwatch"))
        .unwrap_or_else(|| PathBuf::from(".pathwatch"))
}

/// Default directory for rolling log files.
pub fn default_logs_dir() -> PathBuf {
    pathwatch_home().join("logs")
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PathwatchError::Configuration(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let config: T = serde_yaml::from_str(&content).map_err(|e| {
        PathwatchError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

fn load_yaml_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return T::default();
    }
    match load_yaml(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{}, using defaults", e);
            T::default()
        }
    }
}

/// Reconnect backoff for the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// TrafficSim engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficSimConfig {
    /// Packets per cycle.
    pub report_seq: u32,
    /// Inter-packet send interval.
    pub interval_ms: u64,
    /// Round-trip beyond which an unacknowledged packet is lost.
    pub packet_timeout_ms: u64,
    pub handshake_retry_ms: u64,
    pub handshake_budget_ms: u64,
    pub baseline_cycles: usize,
    /// Padding bytes carried by each DATA packet.
    pub payload_size: usize,
    pub monitor_interval_secs: u64,
    pub peer_idle_timeout_secs: u64,
}

impl Default for TrafficSimConfig {
    fn default() -> Self {
        Self {
            report_seq: 60,
            interval_ms: 1_000,
            packet_timeout_ms: 2_000,
            handshake_retry_ms: 1_000,
            handshake_budget_ms: 15_000,
            baseline_cycles: 5,
            payload_size: 64,
            monitor_interval_secs: 10,
            peer_idle_timeout_secs: 30,
        }
    }
}

impl TrafficSimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms.max(1))
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms.max(1))
    }

    pub fn handshake_budget(&self) -> Duration {
        Duration::from_millis(self.handshake_budget_ms.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_idle_timeout_secs.max(1))
    }

    /// A cycle that has not closed after this long is force-closed.
    pub fn hard_cycle_timeout(&self) -> Duration {
        self.interval() * self.report_seq.max(1) * 2 + self.packet_timeout()
    }

    /// Apply the per-probe overrides (`count`, `timeout` in seconds).
    pub fn for_probe(&self, probe: &Probe) -> Self {
        let mut effective = self.clone();
        if probe.count > 0 {
            effective.report_seq = probe.count;
        }
        if probe.timeout > 0 {
            effective.packet_timeout_ms = probe.timeout * 1_000;
        }
        effective
    }
}

/// Parameters for triggered and scheduled one-shot diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// MTR report cycles for an anomaly-triggered run.
    pub mtr_count: u32,
    pub ping_binary: String,
    pub mtr_binary: String,
    /// Upper bound for a single one-shot measurement.
    pub max_runtime_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            mtr_count: 10,
            ping_binary: "ping".to_string(),
            mtr_binary: "mtr".to_string(),
            max_runtime_secs: 120,
        }
    }
}

/// Agent process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub token: String,
    /// WebSocket URL of the controller, e.g. `ws://controller:8085/ws/agent`.
    pub controller_url: String,
    pub poll_interval_secs: u64,
    pub result_queue_capacity: usize,
    pub graceful_shutdown_ms: u64,
    pub reconnect: ReconnectConfig,
    pub trafficsim: TrafficSimConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: AgentId::NONE,
            token: String::new(),
            controller_url: "ws://127.0.0.1:8085/ws/agent".to_string(),
            poll_interval_secs: 60,
            result_queue_capacity: 1024,
            graceful_shutdown_ms: 3_000,
            reconnect: ReconnectConfig::default(),
            trafficsim: TrafficSimConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub const FILE_NAME: &'static str = "agent.yaml";

    /// Load from a file. Returns an error if it is missing or cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }

    /// Load from a file, falling back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        load_yaml_or_default(path)
    }

    pub fn default_path() -> PathBuf {
        pathwatch_home().join(Self::FILE_NAME)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_none() {
            return Err(PathwatchError::Configuration(
                "agent_id must be set to a non-zero value".to_string(),
            ));
        }
        if self.controller_url.is_empty() {
            return Err(PathwatchError::Configuration(
                "controller_url must not be empty".to_string(),
            ));
        }
        if self.trafficsim.report_seq == 0 {
            return Err(PathwatchError::Configuration(
                "trafficsim.report_seq must be at least 1".to_string(),
            ));
        }
        if self.result_queue_capacity == 0 {
            return Err(PathwatchError::Configuration(
                "result_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Controller process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen: SocketAddr,
    /// Seed file for the in-memory store.
    pub seed: Option<PathBuf>,
    /// JSON-lines result file; results are kept in memory when unset.
    pub results: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8085)),
            seed: None,
            results: None,
        }
    }
}

impl ControllerConfig {
    pub const FILE_NAME: &'static str = "controller.yaml";

    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }

    pub fn load_or_default(path: &Path) -> Self {
        load_yaml_or_default(path)
    }

    pub fn default_path() -> PathBuf {
        pathwatch_home().join(Self::FILE_NAME)
    }
}
