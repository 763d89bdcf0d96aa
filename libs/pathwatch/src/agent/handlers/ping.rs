// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::agent::registry::{MeasureRequest, Measurement};
use crate::core::{PathwatchError, Result};

use super::command::run_command;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    pub host: String,
    pub transmitted: u32,
    pub received: u32,
    pub loss_percentage: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub mdev_ms: f64,
}

/// Runs the system `ping`.
pub struct PingMeasurement {
    binary: String,
    max_runtime: Duration,
}

impl PingMeasurement {
    pub fn new(binary: &str, max_runtime: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            max_runtime,
        }
    }
}

impl Measurement for PingMeasurement {
    fn measure(&self, request: MeasureRequest) -> BoxFuture<'static, Result<serde_json::Value>> {
        let binary = self.binary.clone();
        let max_runtime = self.max_runtime;
        Box::pin(async move {
            let args = vec![
                "-n".to_string(),
                "-c".to_string(),
                request.count.max(1).to_string(),
                "-W".to_string(),
                request.timeout.as_secs().max(1).to_string(),
                request.host.clone(),
            ];
            let output = run_command(&binary, &args, max_runtime).await?;
            // ping exits non-zero when nothing came back but still prints a summary.
            let mut report = parse_ping_output(&output.stdout).map_err(|e| {
                if output.success {
                    e
                } else {
                    PathwatchError::Handler(format!("ping failed: {}", output.stderr.trim()))
                }
            })?;
            report.host = request.host;
            Ok(serde_json::to_value(report)?)
        })
    }
}

/// Parse the summary of iputils / BSD `ping`.
pub fn parse_ping_output(output: &str) -> Result<PingReport> {
    let mut report = PingReport::default();
    let mut saw_summary = false;

    for line in output.lines().map(str::trim) {
        if line.contains("packets transmitted") {
            saw_summary = true;
            for part in line.split(',').map(str::trim) {
                let number = part
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches('%');
                if part.ends_with("packets transmitted") {
                    report.transmitted = number.parse().unwrap_or(0);
                } else if part.ends_with("received") {
                    report.received = number.parse().unwrap_or(0);
                } else if part.contains("packet loss") {
                    report.loss_percentage = number.parse().unwrap_or(0.0);
                }
            }
        } else if let Some((label, values)) = line.split_once('=') {
            if !label.contains("min/avg/max") {
                continue;
            }
            let values: Vec<f64> = values
                .trim()
                .trim_end_matches("ms")
                .trim()
                .split('/')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if let [min, avg, max, mdev, ..] = values[..] {
                report.min_ms = min;
                report.avg_ms = avg;
                report.max_ms = max;
                report.mdev_ms = mdev;
            } else if let [min, avg, max] = values[..] {
                report.min_ms = min;
                report.avg_ms = avg;
                report.max_ms = max;
            }
        }
    }

    if !saw_summary {
        return Err(PathwatchError::Handler(
            "no ping summary in output".to_string(),
        ));
    }
    Ok(report)
}
