// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Background check that the session's bound address is still usable.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::ShutdownSignal;

use super::interface::{InterfaceSource, NetInterface};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    AddressLost { name: String, addr: IpAddr },
    AddressRestored { name: String, addr: IpAddr },
}

/// Polls the interface list at a low rate and reports changes. It never
/// touches connection state; the session decides what to do with events.
pub struct InterfaceMonitor {
    source: Arc<dyn InterfaceSource>,
    interval: Duration,
}

impl InterfaceMonitor {
    pub fn new(source: Arc<dyn InterfaceSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// `None` when the interface list could not be read.
    pub fn is_valid(&self, watched: &NetInterface) -> Option<bool> {
        match self.source.interfaces() {
            Ok(list) => Some(list.iter().any(|i| i.addr == watched.addr && i.is_up)),
            Err(e) => {
                tracing::warn!("[TrafficSim] Interface check failed: {}", e);
                None
            }
        }
    }

    pub fn spawn(
        self,
        watched: NetInterface,
        events: mpsc::Sender<InterfaceEvent>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            let mut valid = true;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }

                let Some(now_valid) = self.is_valid(&watched) else {
                    continue;
                };
                if now_valid == valid {
                    continue;
                }
                valid = now_valid;

                let event = if valid {
                    InterfaceEvent::AddressRestored {
                        name: watched.name.clone(),
                        addr: watched.addr,
                    }
                } else {
                    tracing::warn!(
                        "[TrafficSim] Address {} on {} is no longer usable",
                        watched.addr,
                        watched.name
                    );
                    InterfaceEvent::AddressLost {
                        name: watched.name.clone(),
                        addr: watched.addr,
                    }
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        })
    }
}
