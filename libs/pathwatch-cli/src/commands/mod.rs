// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod agent;
pub mod controller;
pub mod resolve;

use pathwatch::agent::ShutdownTrigger;

/// Fire `trigger` on Ctrl+C.
pub(crate) fn trigger_on_ctrl_c(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        trigger.trigger();
    });
}
