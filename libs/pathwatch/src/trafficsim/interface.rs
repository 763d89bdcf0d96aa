// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Local interface discovery and source-interface scoring.

use std::net::IpAddr;
use std::path::Path;

use crate::core::{PathwatchError, Result};

const SCORE_UP: i32 = 50;
const SCORE_CONVENTIONAL_NAME: i32 = 20;
const SCORE_STICKY: i32 = 30;
const SCORE_PRIVATE: i32 = 10;
const PENALTY_VIRTUAL: i32 = -40;

const CONVENTIONAL_PREFIXES: &[&str] = &["eth", "en", "wl"];
const VIRTUAL_PREFIXES: &[&str] = &[
    "docker", "veth", "br-", "virbr", "tun", "tap", "wg", "tailscale", "utun", "vmnet", "zt",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub addr: IpAddr,
    pub is_up: bool,
}

impl NetInterface {
    pub fn new(name: impl Into<String>, addr: IpAddr, is_up: bool) -> Self {
        Self {
            name: name.into(),
            addr,
            is_up,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    pub fn is_virtual(&self) -> bool {
        VIRTUAL_PREFIXES.iter().any(|p| self.name.starts_with(p))
    }
}

/// Where interfaces come from. Swappable so selection can be tested.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> Result<Vec<NetInterface>>;
}

/// Interfaces of the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<NetInterface>> {
        let list = local_ip_address::list_afinet_netifas()
            .map_err(|e| PathwatchError::Transport(format!("interface enumeration: {}", e)))?;
        Ok(list
            .into_iter()
            .map(|(name, addr)| {
                let is_up = operstate_up(&name);
                NetInterface { name, addr, is_up }
            })
            .collect())
    }
}

/// Linux exposes link state under sysfs. Elsewhere a listed address is
/// taken as up.
fn operstate_up(name: &str) -> bool {
    let path = Path::new("/sys/class/net").join(name).join("operstate");
    match std::fs::read_to_string(path) {
        Ok(state) => matches!(state.trim(), "up" | "unknown"),
        Err(_) => true,
    }
}

/// Score-based source interface choice with stickiness.
#[derive(Debug, Default, Clone)]
pub struct InterfaceSelector {
    last_good: Option<String>,
}

impl InterfaceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_good(&self) -> Option<&str> {
        self.last_good.as_deref()
    }

    /// Remember the interface that carried a successful session.
    pub fn mark_good(&mut self, name: &str) {
        self.last_good = Some(name.to_string());
    }

    pub fn forget(&mut self) {
        self.last_good = None;
    }

    pub fn score(&self, iface: &NetInterface) -> i32 {
        let mut score = 0;
        if iface.is_up {
            score += SCORE_UP;
        }
        if CONVENTIONAL_PREFIXES.iter().any(|p| iface.name.starts_with(p)) {
            score += SCORE_CONVENTIONAL_NAME;
        }
        if self.last_good.as_deref() == Some(iface.name.as_str()) {
            score += SCORE_STICKY;
        }
        if is_private(&iface.addr) {
            score += SCORE_PRIVATE;
        }
        if iface.is_virtual() {
            score += PENALTY_VIRTUAL;
        }
        score
    }

    /// Pick the best interface to reach `target`. Ties break by name.
    pub fn select(&self, candidates: &[NetInterface], target: IpAddr) -> Option<NetInterface> {
        candidates
            .iter()
            .filter(|i| i.addr.is_ipv4() == target.is_ipv4())
            .filter(|i| i.is_loopback() == target.is_loopback())
            .map(|i| (self.score(i), i))
            .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| b.name.cmp(&a.name)))
            .map(|(_, i)| i.clone())
    }
}

fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique local
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, addr: &str, up: bool) -> NetInterface {
        NetInterface::new(name, addr.parse().unwrap(), up)
    }

    #[test]
    fn test_prefers_conventional_up_interface() {
        let selector = InterfaceSelector::new();
        let candidates = vec![
            iface("docker0", "172.17.0.1", true),
            iface("eth0", "192.168.1.20", true),
            iface("wg0", "10.8.0.2", true),
        ];
        let chosen = selector.select(&candidates, "203.0.113.5".parse().unwrap());
        assert_eq!(chosen.unwrap().name, "eth0");
        assert_eq!(selector.score(&candidates[1]), 80);
        assert_eq!(selector.score(&candidates[0]), 20);
    }

    #[test]
    fn test_stickiness_outweighs_name_bonus() {
        let mut selector = InterfaceSelector::new();
        let candidates = vec![
            iface("eth0", "192.168.1.20", true),
            iface("bond0", "192.168.2.20", true),
        ];
        selector.mark_good("bond0");
        let chosen = selector.select(&candidates, "203.0.113.5".parse().unwrap());
        assert_eq!(chosen.unwrap().name, "bond0");
    }

    #[test]
    fn test_loopback_only_for_loopback_targets() {
        let selector = InterfaceSelector::new();
        let candidates = vec![
            iface("lo", "127.0.0.1", true),
            iface("eth0", "192.168.1.20", true),
        ];
        let remote = selector.select(&candidates, "203.0.113.5".parse().unwrap());
        assert_eq!(remote.unwrap().name, "eth0");
        let local = selector.select(&candidates, "127.0.0.1".parse().unwrap());
        assert_eq!(local.unwrap().name, "lo");
    }

    #[test]
    fn test_address_family_and_ties() {
        let selector = InterfaceSelector::new();
        let candidates = vec![
            iface("eth1", "192.168.1.21", true),
            iface("eth0", "192.168.1.20", true),
            iface("eth2", "fd00::2", true),
        ];
        let chosen = selector.select(&candidates, "198.51.100.1".parse().unwrap());
        assert_eq!(chosen.unwrap().name, "eth0");
        let v6 = selector.select(&candidates, "2001:db8::1".parse().unwrap());
        assert_eq!(v6.unwrap().name, "eth2");
        assert!(selector.select(&[], "198.51.100.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_down_interface_loses() {
        let selector = InterfaceSelector::new();
        let candidates = vec![
            iface("eth0", "192.168.1.20", false),
            iface("ens3", "192.168.1.30", true),
        ];
        let chosen = selector.select(&candidates, "198.51.100.1".parse().unwrap());
        assert_eq!(chosen.unwrap().name, "ens3");
    }
}
