// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Agent-to-agent active network measurement.
//!
//! Agents pull a resolved probe set from a controller over a WebSocket
//! control channel, run a session per probe target, and push results back.
//! The TrafficSim engine keeps a long-lived UDP conversation with a peer
//! agent and reports loss, latency and jitter per fixed-size cycle.

pub mod agent;
pub mod control;
pub mod controller;
pub mod core;
pub mod trafficsim;

pub use crate::core::{PathwatchError, Result};
