// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Controller-side data the resolver reads: probes, agent records,
//! network-info samples and group membership.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::{AgentId, GroupId, PathwatchError, Probe, ProbeType, Result};

/// Agent record as managed by the (external) membership system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    /// Pre-shared token checked on the control channel.
    #[serde(default)]
    pub token: String,
    /// Manual address override; wins over network-info samples.
    #[serde(default)]
    pub public_ip_override: Option<String>,
}

/// Last-known network information reported for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInfoSample {
    pub agent_id: AgentId,
    pub public_address: String,
    pub observed_at: DateTime<Utc>,
}

/// Read access the resolver needs from the controller's storage.
pub trait ControllerStore: Send + Sync {
    fn agent(&self, agent_id: AgentId) -> Option<AgentRecord>;

    /// Probes owned by an agent, ordered by id.
    fn probes_for_agent(&self, agent_id: AgentId) -> Vec<Probe>;

    /// Every probe of a given type, across all agents, ordered by id.
    fn probes_of_type(&self, probe_type: ProbeType) -> Vec<Probe>;

    fn latest_netinfo(&self, agent_id: AgentId) -> Option<NetInfoSample>;

    fn group_members(&self, group_id: GroupId) -> Vec<AgentId>;

    /// Record a fresh network-info sample.
    fn record_netinfo(&self, sample: NetInfoSample);
}

/// Seed file layout for [`MemoryStore`].
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(default)]
    pub probes: Vec<Probe>,
    #[serde(default)]
    pub netinfo: Vec<NetInfoSample>,
    #[serde(default)]
    pub groups: HashMap<GroupId, Vec<AgentId>>,
}

/// Thread-safe in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    probes: RwLock<BTreeMap<(crate::core::ProbeId, ProbeType), Probe>>,
    netinfo: RwLock<HashMap<AgentId, Vec<NetInfoSample>>>,
    groups: RwLock<HashMap<GroupId, Vec<AgentId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        for agent in seed.agents {
            store.upsert_agent(agent);
        }
        for probe in seed.probes {
            store.upsert_probe(probe);
        }
        for sample in seed.netinfo {
            store.record_netinfo(sample);
        }
        for (group, members) in seed.groups {
            store.set_group(group, members);
        }
        store
    }

    /// Load a YAML seed file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PathwatchError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let seed: StoreSeed = serde_yaml::from_str(&content).map_err(|e| {
            PathwatchError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!(
            "[Controller] Loaded seed {} ({} agents, {} probes)",
            path.display(),
            seed.agents.len(),
            seed.probes.len()
        );
        Ok(Self::from_seed(seed))
    }

    pub fn upsert_agent(&self, agent: AgentRecord) {
        self.inner.agents.write().insert(agent.id, agent);
    }

    pub fn upsert_probe(&self, probe: Probe) {
        self.inner
            .probes
            .write()
            .insert((probe.id, probe.probe_type), probe);
    }

    pub fn remove_probe(&self, probe: &Probe) {
        self.inner
            .probes
            .write()
            .remove(&(probe.id, probe.probe_type));
    }

    pub fn set_group(&self, group_id: GroupId, members: Vec<AgentId>) {
        self.inner.groups.write().insert(group_id, members);
    }

    pub fn agent_count(&self) -> usize {
        self.inner.agents.read().len()
    }
}

impl ControllerStore for MemoryStore {
    fn agent(&self, agent_id: AgentId) -> Option<AgentRecord> {
        self.inner.agents.read().get(&agent_id).cloned()
    }

    fn probes_for_agent(&self, agent_id: AgentId) -> Vec<Probe> {
        self.inner
            .probes
            .read()
            .values()
            .filter(|p| p.agent_id == agent_id)
            .cloned()
            .collect()
    }

    fn probes_of_type(&self, probe_type: ProbeType) -> Vec<Probe> {
        self.inner
            .probes
            .read()
            .values()
            .filter(|p| p.probe_type == probe_type)
            .cloned()
            .collect()
    }

    fn latest_netinfo(&self, agent_id: AgentId) -> Option<NetInfoSample> {
        self.inner
            .netinfo
            .read()
            .get(&agent_id)
            .and_then(|samples| samples.iter().max_by_key(|s| s.observed_at).cloned())
    }

    fn group_members(&self, group_id: GroupId) -> Vec<AgentId> {
        self.inner
            .groups
            .read()
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record_netinfo(&self, sample: NetInfoSample) {
        const MAX_SAMPLES_PER_AGENT: usize = 16;

        let mut netinfo = self.inner.netinfo.write();
        let samples = netinfo.entry(sample.agent_id).or_default();
        samples.push(sample);
        if samples.len() > MAX_SAMPLES_PER_AGENT {
            samples.sort_by_key(|s| s.observed_at);
            let excess = samples.len() - MAX_SAMPLES_PER_AGENT;
            samples.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProbeId;
    use chrono::TimeZone;

    fn sample(agent: u64, addr: &str, secs: i64) -> NetInfoSample {
        NetInfoSample {
            agent_id: AgentId(agent),
            public_address: addr.to_string(),
            observed_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_latest_netinfo_picks_newest_sample() {
        let store = MemoryStore::new();
        store.record_netinfo(sample(1, "198.51.100.1", 200));
        store.record_netinfo(sample(1, "198.51.100.9", 100));
        assert_eq!(
            store.latest_netinfo(AgentId(1)).unwrap().public_address,
            "198.51.100.1"
        );
        assert!(store.latest_netinfo(AgentId(2)).is_none());
    }

    #[test]
    fn test_netinfo_history_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..40 {
            store.record_netinfo(sample(1, &format!("10.0.0.{}", i), i));
        }
        assert_eq!(store.inner.netinfo.read()[&AgentId(1)].len(), 16);
        assert_eq!(
            store.latest_netinfo(AgentId(1)).unwrap().public_address,
            "10.0.0.39"
        );
    }

    #[test]
    fn test_seed_yaml() {
        let yaml = r#"
agents:
  - id: 1
    name: east
    token: t1
  - id: 2
    name: west
    public_ip_override: 203.0.113.7
probes:
  - id: 10
    agent_id: 1
    type: PING
    targets:
      - target: 8.8.8.8
groups:
  5: [1, 2]
"#;
        let seed: StoreSeed = serde_yaml::from_str(yaml).unwrap();
        let store = MemoryStore::from_seed(seed);
        assert_eq!(store.agent_count(), 2);
        assert_eq!(
            store.agent(AgentId(2)).unwrap().public_ip_override.as_deref(),
            Some("203.0.113.7")
        );
        let probes = store.probes_for_agent(AgentId(1));
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].id, ProbeId(10));
        assert!(probes[0].enabled);
        assert_eq!(
            store.group_members(GroupId(5)),
            vec![AgentId(1), AgentId(2)]
        );
    }
}
