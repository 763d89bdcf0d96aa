// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agent::registry::{MeasureRequest, Measurement, ProbeHandler};
use crate::agent::session::SessionContext;
use crate::core::{ProbeResult, ProbeType, host_of};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs a one-shot measurement once per probe interval until stopped.
pub struct ScheduledHandler {
    probe_type: ProbeType,
    measurement: Arc<dyn Measurement>,
    default_count: u32,
}

impl ScheduledHandler {
    pub fn new(probe_type: ProbeType, measurement: Arc<dyn Measurement>, default_count: u32) -> Self {
        Self {
            probe_type,
            measurement,
            default_count,
        }
    }

    fn request_for(&self, ctx: &SessionContext) -> MeasureRequest {
        let probe = &ctx.probe;
        MeasureRequest {
            host: host_of(&ctx.target).to_string(),
            count: if probe.count > 0 {
                probe.count
            } else {
                self.default_count
            },
            timeout: if probe.timeout > 0 {
                Duration::from_secs(probe.timeout)
            } else {
                DEFAULT_TIMEOUT
            },
        }
    }
}

impl ProbeHandler for ScheduledHandler {
    fn spawn(&self, ctx: SessionContext) -> JoinHandle<()> {
        let probe_type = self.probe_type;
        let measurement = self.measurement.clone();
        let request = self.request_for(&ctx);
        let period = if ctx.probe.interval > 0 {
            Duration::from_secs(ctx.probe.interval)
        } else {
            DEFAULT_INTERVAL
        };

        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown.clone();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = tokio::select! {
                    _ = shutdown.wait() => break,
                    outcome = measurement.measure(request.clone()) => outcome,
                };
                match outcome {
                    Ok(payload) => {
                        ctx.report(ProbeResult::new(
                            ctx.probe.id,
                            probe_type,
                            ctx.target.clone(),
                            ctx.target_agent,
                            payload,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(
                            "[Agent] {} probe {} towards {} failed: {}",
                            probe_type,
                            ctx.probe.id,
                            request.host,
                            e
                        );
                    }
                }
            }
            tracing::debug!("[Agent] {} session for probe {} stopped", probe_type, ctx.probe.id);
        })
    }
}
