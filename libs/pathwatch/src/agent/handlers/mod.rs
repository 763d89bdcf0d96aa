// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One-shot PING / MTR measurements and their periodic session wrapper.

mod command;
mod mtr;
mod ping;
mod scheduled;

pub use mtr::MtrMeasurement;
pub use ping::{PingMeasurement, PingReport, parse_ping_output};
pub use scheduled::ScheduledHandler;
