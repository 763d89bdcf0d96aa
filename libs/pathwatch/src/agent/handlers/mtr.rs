// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::agent::registry::{MeasureRequest, Measurement};
use crate::core::{PathwatchError, Result};

use super::command::run_command;

/// Runs `mtr --json` and forwards its report.
pub struct MtrMeasurement {
    binary: String,
    max_runtime: Duration,
}

impl MtrMeasurement {
    pub fn new(binary: &str, max_runtime: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            max_runtime,
        }
    }
}

impl Measurement for MtrMeasurement {
    fn measure(&self, request: MeasureRequest) -> BoxFuture<'static, Result<serde_json::Value>> {
        let binary = self.binary.clone();
        let max_runtime = self.max_runtime;
        Box::pin(async move {
            let args = vec![
                "--json".to_string(),
                "-n".to_string(),
                "-c".to_string(),
                request.count.max(1).to_string(),
                request.host.clone(),
            ];
            let output = run_command(&binary, &args, max_runtime).await?;
            if !output.success {
                return Err(PathwatchError::Handler(format!(
                    "mtr failed: {}",
                    output.stderr.trim()
                )));
            }
            parse_mtr_output(&output.stdout)
        })
    }
}

fn parse_mtr_output(stdout: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(stdout)?;
    if value.get("report").is_none() {
        return Err(PathwatchError::Handler(
            "mtr output has no report".to_string(),
        ));
    }
    Ok(value)
}
