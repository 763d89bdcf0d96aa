// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Opaque identifiers shared by controller and agents.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

opaque_id!(
    /// Identifier of an agent. `0` means "no agent" on the wire.
    AgentId
);

opaque_id!(
    /// Identifier of a probe. Expanded probes keep their parent's id.
    ProbeId
);

opaque_id!(
    /// Identifier of an agent group.
    GroupId
);

impl AgentId {
    /// The wire value used when a result has no target agent.
    pub const NONE: AgentId = AgentId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}
