// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod config;
pub mod error;
pub mod ids;
pub mod probe;
pub mod result;

pub use config::{
    AgentConfig, ControllerConfig, DiagnosticsConfig, ReconnectConfig, TrafficSimConfig,
    default_logs_dir, pathwatch_home,
};
pub use error::{PathwatchError, Result};
pub use ids::{AgentId, GroupId, ProbeId};
pub use probe::{
    BIDIR_MARKER, Probe, ProbeTarget, ProbeType, TargetAddr, host_of, join_host_port, port_of,
};
pub use result::{ProbeResult, ResultRecord};
