// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::path::PathBuf;

use anyhow::{Context, Result};
use pathwatch::agent::{Agent, shutdown_channel};
use pathwatch::core::{AgentConfig, AgentId};

/// Run an agent until Ctrl+C. Flags and environment override the config file.
pub async fn run(
    config_path: Option<PathBuf>,
    agent_id: Option<u64>,
    token: Option<String>,
    controller_url: Option<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => AgentConfig::load(&path)
            .with_context(|| format!("Failed to load agent config {}", path.display()))?,
        None => AgentConfig::load_or_default(&AgentConfig::default_path()),
    };
    if let Some(id) = agent_id {
        config.agent_id = AgentId(id);
    }
    if let Some(token) = token {
        config.token = token;
    }
    if let Some(url) = controller_url {
        config.controller_url = url;
    }
    config.validate().context("Invalid agent configuration")?;

    let (trigger, signal) = shutdown_channel();
    super::trigger_on_ctrl_c(trigger);

    Agent::new(config).run(signal).await?;
    Ok(())
}
