// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Turns an agent's stored probes into the fully resolved set it pulls.
//!
//! Agent references are resolved to literal addresses on every pull and are
//! never written back to the store. AGENT probes are expanded into concrete
//! PING / MTR / TRAFFICSIM probes that keep the parent id, and a TrafficSim
//! server receives bidirectional anchors for the peers that measure it.

use std::sync::Arc;

use crate::core::{AgentId, Probe, ProbeTarget, ProbeType, join_host_port};

use super::store::ControllerStore;

/// Types an AGENT probe expands into, in order.
const AGENT_EXPANSION: [ProbeType; 3] = [ProbeType::Ping, ProbeType::Mtr, ProbeType::TrafficSim];

pub struct TargetResolver {
    store: Arc<dyn ControllerStore>,
}

impl TargetResolver {
    pub fn new(store: Arc<dyn ControllerStore>) -> Self {
        Self { store }
    }

    /// Resolve the complete probe set for `agent_id`.
    pub fn resolve(&self, agent_id: AgentId) -> Vec<Probe> {
        let own = self.store.probes_for_agent(agent_id);
        let runs_server = own.iter().any(|p| p.is_trafficsim_server() && p.enabled);

        let mut resolved = Vec::with_capacity(own.len());
        for probe in &own {
            match probe.probe_type {
                ProbeType::Agent => resolved.extend(self.expand_agent_probe(agent_id, probe)),
                ProbeType::TrafficSim if probe.server => {
                    resolved.push(self.resolve_server_probe(agent_id, probe))
                }
                _ => resolved.push(self.resolve_probe(agent_id, probe)),
            }
        }

        if runs_server {
            resolved.extend(self.bidir_anchors(agent_id));
        }

        tracing::debug!(
            "[Resolver] Resolved {} stored probe(s) into {} for agent {}",
            own.len(),
            resolved.len(),
            agent_id
        );
        resolved
    }

    /// Address of an agent: manual override first, then the latest
    /// network-info sample.
    pub fn agent_address(&self, agent_id: AgentId) -> Option<String> {
        let override_ip = self
            .store
            .agent(agent_id)
            .and_then(|a| a.public_ip_override)
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        if override_ip.is_some() {
            return override_ip;
        }
        self.store
            .latest_netinfo(agent_id)
            .map(|s| s.public_address.trim().to_string())
            .filter(|ip| !ip.is_empty())
    }

    /// The enabled TrafficSim server probe an agent runs, if any.
    fn server_probe_of(&self, agent_id: AgentId) -> Option<Probe> {
        self.store
            .probes_for_agent(agent_id)
            .into_iter()
            .find(|p| p.is_trafficsim_server() && p.enabled)
    }

    fn resolve_probe(&self, requester: AgentId, probe: &Probe) -> Probe {
        let mut resolved = probe.clone();
        resolved.targets = self
            .expand_groups(requester, &probe.targets)
            .iter()
            .map(|t| self.resolve_target(t, probe.probe_type))
            .collect();
        resolved
    }

    fn resolve_target(&self, target: &ProbeTarget, probe_type: ProbeType) -> ProbeTarget {
        if !target.target.trim().is_empty() {
            return target.clone();
        }
        let Some(agent) = target.agent else {
            return target.clone();
        };

        let address = match probe_type {
            ProbeType::TrafficSim => self.trafficsim_address(agent),
            _ => self.agent_address(agent),
        };
        if address.is_none() {
            tracing::debug!(
                "[Resolver] No address for agent {} ({}), leaving target empty",
                agent,
                probe_type
            );
        }

        ProbeTarget {
            target: address.unwrap_or_default(),
            agent: Some(agent),
            group: None,
        }
    }

    /// `ip:port` of an agent's TrafficSim listener.
    fn trafficsim_address(&self, agent: AgentId) -> Option<String> {
        let port = self.server_probe_of(agent)?.listen_port()?;
        let ip = self.agent_address(agent)?;
        Some(join_host_port(&ip, port))
    }

    fn expand_groups(&self, requester: AgentId, targets: &[ProbeTarget]) -> Vec<ProbeTarget> {
        let mut expanded = Vec::with_capacity(targets.len());
        for target in targets {
            match target.group {
                Some(group) if target.target.trim().is_empty() => {
                    expanded.extend(
                        self.store
                            .group_members(group)
                            .into_iter()
                            .filter(|m| *m != requester)
                            .map(ProbeTarget::agent),
                    );
                }
                _ => expanded.push(target.clone()),
            }
        }
        expanded
    }

    fn expand_agent_probe(&self, requester: AgentId, probe: &Probe) -> Vec<Probe> {
        let targets = self.expand_groups(requester, &probe.targets);
        let mut expanded = Vec::new();

        for probe_type in AGENT_EXPANSION {
            let concrete: Vec<ProbeTarget> = targets
                .iter()
                .filter(|t| match probe_type {
                    // Only agents that run a listener can be measured with TrafficSim.
                    ProbeType::TrafficSim => t
                        .agent
                        .is_some_and(|a| self.server_probe_of(a).is_some()),
                    _ => true,
                })
                .map(|t| self.resolve_target(t, probe_type))
                .collect();

            if concrete.is_empty() {
                continue;
            }

            expanded.push(Probe {
                probe_type,
                server: false,
                targets: concrete,
                ..probe.clone()
            });
        }

        expanded
    }

    fn targets_agent(&self, probe: &Probe, agent: AgentId) -> bool {
        probe.targets.iter().any(|t| {
            t.agent == Some(agent)
                || t
                    .group
                    .is_some_and(|g| self.store.group_members(g).contains(&agent))
        })
    }

    /// Add the owners of inbound agent/client probes to the allow-list.
    fn resolve_server_probe(&self, server_agent: AgentId, probe: &Probe) -> Probe {
        let mut resolved = probe.clone();

        let inbound = self
            .store
            .probes_of_type(ProbeType::Agent)
            .into_iter()
            .chain(
                self.store
                    .probes_of_type(ProbeType::TrafficSim)
                    .into_iter()
                    .filter(|p| !p.server),
            )
            .filter(|p| p.agent_id != server_agent && p.enabled)
            .filter(|p| self.targets_agent(p, server_agent));

        for client in inbound {
            let already = resolved.allowed_agents().any(|a| a == client.agent_id);
            if !already {
                resolved.targets.push(ProbeTarget::agent(client.agent_id));
            }
        }

        resolved
    }

    /// Reverse-direction anchors: one per AGENT probe aimed at this server.
    fn bidir_anchors(&self, server_agent: AgentId) -> Vec<Probe> {
        self.store
            .probes_of_type(ProbeType::Agent)
            .into_iter()
            .filter(|p| p.agent_id != server_agent)
            .filter(|p| self.targets_agent(p, server_agent))
            .map(|p| {
                let peer_ip = self.agent_address(p.agent_id).unwrap_or_default();
                Probe {
                    agent_id: server_agent,
                    probe_type: ProbeType::TrafficSim,
                    server: false,
                    targets: vec![ProbeTarget::bidir_anchor(&peer_ip, p.agent_id)],
                    ..p
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::store::{AgentRecord, MemoryStore, NetInfoSample};
    use crate::core::{GroupId, ProbeId, TargetAddr};
    use chrono::Utc;

    fn agent(id: u64, override_ip: Option<&str>) -> AgentRecord {
        AgentRecord {
            id: AgentId(id),
            name: format!("agent-{}", id),
            token: String::new(),
            public_ip_override: override_ip.map(str::to_string),
        }
    }

    fn netinfo(id: u64, addr: &str) -> NetInfoSample {
        NetInfoSample {
            agent_id: AgentId(id),
            public_address: addr.to_string(),
            observed_at: Utc::now(),
        }
    }

    fn server_probe(id: u64, owner: u64, listen: &str) -> Probe {
        Probe {
            server: true,
            ..Probe::new(ProbeId(id), AgentId(owner), ProbeType::TrafficSim)
        }
        .with_targets(vec![ProbeTarget::literal(listen)])
    }

    fn resolver(store: &MemoryStore) -> TargetResolver {
        TargetResolver::new(Arc::new(store.clone()))
    }

    #[test]
    fn test_override_wins_over_netinfo() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, Some("203.0.113.50")));
        store.record_netinfo(netinfo(2, "198.51.100.2"));
        assert_eq!(
            resolver(&store).agent_address(AgentId(2)).as_deref(),
            Some("203.0.113.50")
        );
    }

    #[test]
    fn test_netinfo_used_without_override() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, None));
        store.record_netinfo(netinfo(2, "198.51.100.2"));
        assert_eq!(
            resolver(&store).agent_address(AgentId(2)).as_deref(),
            Some("198.51.100.2")
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(1, None));
        store.upsert_agent(agent(2, None));
        store.record_netinfo(netinfo(2, "198.51.100.2"));
        store.upsert_probe(
            Probe::new(ProbeId(10), AgentId(1), ProbeType::Ping)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );

        let r = resolver(&store);
        let first = r.resolve(AgentId(1));
        let second = r.resolve(AgentId(1));
        assert_eq!(first, second);
        assert_eq!(first[0].targets[0].target, "198.51.100.2");
    }

    #[test]
    fn test_unresolvable_agent_leaves_empty_target() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(1, None));
        store.upsert_agent(agent(2, None));
        store.upsert_probe(
            Probe::new(ProbeId(11), AgentId(1), ProbeType::Ping)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );

        let probes = resolver(&store).resolve(AgentId(1));
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].targets[0].classify(), TargetAddr::Unresolved);
        assert_eq!(probes[0].targets[0].agent, Some(AgentId(2)));
    }

    #[test]
    fn test_trafficsim_target_gets_server_port() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_probe(server_probe(20, 2, "0.0.0.0:5050"));
        store.upsert_probe(
            Probe::new(ProbeId(21), AgentId(1), ProbeType::TrafficSim)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );

        let probes = resolver(&store).resolve(AgentId(1));
        assert_eq!(probes[0].targets[0].target, "203.0.113.2:5050");
    }

    #[test]
    fn test_trafficsim_target_without_server_stays_empty() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_probe(
            Probe::new(ProbeId(21), AgentId(1), ProbeType::TrafficSim)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );
        let probes = resolver(&store).resolve(AgentId(1));
        assert!(probes[0].targets[0].target.is_empty());
    }

    #[test]
    fn test_agent_probe_expansion_keeps_id() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(1, Some("203.0.113.1")));
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_probe(server_probe(30, 2, "0.0.0.0:5000"));
        store.upsert_probe(
            Probe::new(ProbeId(31), AgentId(1), ProbeType::Agent)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );

        let probes = resolver(&store).resolve(AgentId(1));
        let types: Vec<_> = probes.iter().map(|p| p.probe_type).collect();
        assert_eq!(
            types,
            vec![ProbeType::Ping, ProbeType::Mtr, ProbeType::TrafficSim]
        );
        assert!(probes.iter().all(|p| p.id == ProbeId(31)));
        assert_eq!(probes[0].targets[0].target, "203.0.113.2");
        assert_eq!(probes[2].targets[0].target, "203.0.113.2:5000");
        assert_eq!(probes[2].targets[0].agent, Some(AgentId(2)));
    }

    #[test]
    fn test_agent_probe_without_server_skips_trafficsim() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_probe(
            Probe::new(ProbeId(31), AgentId(1), ProbeType::Agent)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );
        let probes = resolver(&store).resolve(AgentId(1));
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|p| p.probe_type != ProbeType::TrafficSim));
    }

    #[test]
    fn test_server_side_gets_anchor_and_allow_list() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(1, Some("203.0.113.1")));
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_probe(server_probe(30, 2, "0.0.0.0:5000"));
        store.upsert_probe(
            Probe::new(ProbeId(31), AgentId(1), ProbeType::Agent)
                .with_targets(vec![ProbeTarget::agent(AgentId(2))]),
        );

        let probes = resolver(&store).resolve(AgentId(2));
        assert_eq!(probes.len(), 2);

        let server = &probes[0];
        assert!(server.is_trafficsim_server());
        assert_eq!(server.allowed_agents().collect::<Vec<_>>(), vec![AgentId(1)]);

        let anchor = &probes[1];
        assert_eq!(anchor.id, ProbeId(31));
        assert_eq!(anchor.agent_id, AgentId(2));
        assert_eq!(
            anchor.targets[0].classify(),
            TargetAddr::BidirAnchor("203.0.113.1".into())
        );
        assert_eq!(anchor.targets[0].target, "203.0.113.1:bidir");
    }

    #[test]
    fn test_group_targets_expand_without_requester() {
        let store = MemoryStore::new();
        store.upsert_agent(agent(2, Some("203.0.113.2")));
        store.upsert_agent(agent(3, Some("203.0.113.3")));
        store.set_group(GroupId(7), vec![AgentId(1), AgentId(2), AgentId(3)]);
        store.upsert_probe(
            Probe::new(ProbeId(40), AgentId(1), ProbeType::Ping)
                .with_targets(vec![ProbeTarget::group(GroupId(7))]),
        );

        let probes = resolver(&store).resolve(AgentId(1));
        let targets: Vec<_> = probes[0].targets.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, vec!["203.0.113.2", "203.0.113.3"]);
    }
}
