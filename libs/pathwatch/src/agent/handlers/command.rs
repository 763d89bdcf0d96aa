// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::core::{PathwatchError, Result};

pub(super) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run an external tool, killing it if it outlives `max_runtime`.
pub(super) async fn run_command(
    binary: &str,
    args: &[String],
    max_runtime: Duration,
) -> Result<CommandOutput> {
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PathwatchError::Handler(format!("failed to start {}: {}", binary, e)))?;

    let output = tokio::time::timeout(max_runtime, child.wait_with_output())
        .await
        .map_err(|_| {
            PathwatchError::Handler(format!("{} exceeded {:?}", binary, max_runtime))
        })??;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
