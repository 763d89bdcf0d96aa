// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Control-plane wire protocol shared by the controller and agents.

mod protocol;

pub use protocol::{AGENT_WS_PATH, ControlMessage};
