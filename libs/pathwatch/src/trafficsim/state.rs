// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Connection lifecycle of a TrafficSim session.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::{PathwatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InterfaceSelect,
    Connecting,
    /// Client only.
    Handshaking,
    Active,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Stopped, _) => false,
            (ShuttingDown, Stopped) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Idle, InterfaceSelect) => true,
            (InterfaceSelect, Connecting | Degraded) => true,
            (Connecting, Handshaking | Active | Degraded) => true,
            (Handshaking, Active | Degraded) => true,
            (Active, Degraded) => true,
            (Degraded, Active | Connecting | InterfaceSelect) => true,
            _ => false,
        }
    }
}

/// Validated state holder. Observers subscribe through a watch channel.
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    pub fn transition(&self, next: ConnectionState) -> Result<()> {
        let from = self.current();
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(PathwatchError::InvalidTransition { from, to: next });
        }
        tracing::trace!("[TrafficSim] State {:?} -> {:?}", from, next);
        self.tx.send_replace(next);
        Ok(())
    }

    /// `ShuttingDown` then `Stopped`, from wherever the session is.
    pub fn stop(&self) {
        if self.current().is_terminal() {
            return;
        }
        self.tx.send_replace(ConnectionState::ShuttingDown);
        self.tx.send_replace(ConnectionState::Stopped);
    }
}
