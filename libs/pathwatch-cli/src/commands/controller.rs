// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use pathwatch::agent::shutdown_channel;
use pathwatch::controller::{
    ControllerState, ControllerStore, JsonLinesSink, MemorySink, MemoryStore, ResultSink, serve,
};
use pathwatch::core::ControllerConfig;

pub async fn run(
    config_path: Option<PathBuf>,
    listen: Option<SocketAddr>,
    seed: Option<PathBuf>,
    results: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ControllerConfig::load(&path)
            .with_context(|| format!("Failed to load controller config {}", path.display()))?,
        None => ControllerConfig::load_or_default(&ControllerConfig::default_path()),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    if results.is_some() {
        config.results = results;
    }

    let store: Arc<dyn ControllerStore> = match &config.seed {
        Some(path) => Arc::new(
            MemoryStore::load(path)
                .with_context(|| format!("Failed to load seed {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No seed file configured, starting with an empty store");
            Arc::new(MemoryStore::new())
        }
    };
    let sink: Arc<dyn ResultSink> = match &config.results {
        Some(path) => Arc::new(
            JsonLinesSink::open(path)
                .with_context(|| format!("Failed to open results file {}", path.display()))?,
        ),
        None => Arc::new(MemorySink::new()),
    };

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tracing::info!("Controller listening on {}", config.listen);

    let (trigger, mut signal) = shutdown_channel();
    super::trigger_on_ctrl_c(trigger);

    let state = ControllerState::new(store, sink);
    serve(listener, state, async move { signal.wait().await }).await?;
    Ok(())
}
