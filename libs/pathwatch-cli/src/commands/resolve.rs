// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pathwatch::controller::{MemoryStore, TargetResolver};
use pathwatch::core::AgentId;

/// Print the resolved probe list for one agent as JSON.
pub fn run(seed: &Path, agent_id: u64) -> Result<()> {
    let store = MemoryStore::load(seed)
        .with_context(|| format!("Failed to load seed {}", seed.display()))?;
    let resolver = TargetResolver::new(Arc::new(store));
    let probes = resolver.resolve(AgentId(agent_id));

    println!("{}", serde_json::to_string_pretty(&probes)?);
    Ok(())
}
