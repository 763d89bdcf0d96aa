// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Controller side of the dispatch protocol.

mod resolver;
mod server;
mod sink;
mod store;

pub use resolver::TargetResolver;
pub use server::{ControllerState, router, serve};
pub use sink::{JsonLinesSink, MemorySink, ResultSink};
pub use store::{AgentRecord, ControllerStore, MemoryStore, NetInfoSample, StoreSeed};
