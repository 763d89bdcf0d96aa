// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Baseline learning and the anomaly trigger.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::stats::FlowStats;

pub const LOSS_THRESHOLD_PCT: f64 = 5.0;
pub const LATENCY_FACTOR: f64 = 2.0;
pub const JITTER_FACTOR: f64 = 3.0;

/// Mean RTT and RTT stddev averaged over the first cycles, then frozen.
#[derive(Debug, Clone)]
pub struct Baseline {
    required: usize,
    observed: usize,
    sum_mean_ms: f64,
    sum_stddev_ms: f64,
    frozen: Option<FrozenBaseline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrozenBaseline {
    pub mean_rtt_ms: f64,
    pub rtt_stddev_ms: f64,
}

impl Baseline {
    pub fn new(cycles: usize) -> Self {
        Self {
            required: cycles.max(1),
            observed: 0,
            sum_mean_ms: 0.0,
            sum_stddev_ms: 0.0,
            frozen: None,
        }
    }

    pub fn frozen(&self) -> Option<FrozenBaseline> {
        self.frozen
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Feed one cycle. Cycles without samples and cycles after freezing are
    /// ignored. Returns `true` on the cycle that freezes the baseline.
    pub fn observe(&mut self, stats: &FlowStats) -> bool {
        if self.frozen.is_some() || !stats.has_samples() {
            return false;
        }
        self.observed += 1;
        self.sum_mean_ms += stats.rtt.mean;
        self.sum_stddev_ms += stats.rtt.stddev;

        if self.observed < self.required {
            return false;
        }
        let n = self.observed as f64;
        self.frozen = Some(FrozenBaseline {
            mean_rtt_ms: self.sum_mean_ms / n,
            rtt_stddev_ms: self.sum_stddev_ms / n,
        });
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnomalyReason {
    PacketLoss { pct: f64 },
    HighLatency { ms: f64 },
    JitterSpike { ms: f64 },
}

impl AnomalyReason {
    /// Machine-readable tag carried as `triggered_reason`.
    pub fn tag(&self) -> String {
        match self {
            AnomalyReason::PacketLoss { pct } => format!("packet_loss:{:.2}%", pct),
            AnomalyReason::HighLatency { ms } => format!("high_latency:{:.2}ms", ms),
            AnomalyReason::JitterSpike { ms } => format!("jitter_spike:{:.2}ms", ms),
        }
    }
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Checks each cycle against the thresholds, first match wins.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    baseline: Baseline,
}

impl AnomalyDetector {
    pub fn new(baseline_cycles: usize) -> Self {
        Self {
            baseline: Baseline::new(baseline_cycles),
        }
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Evaluate a closed cycle against the baseline learned so far, then let
    /// the baseline learn from it.
    pub fn evaluate(&mut self, stats: &FlowStats) -> Option<AnomalyReason> {
        if stats.packets_sent == 0 {
            return None;
        }
        let reason = self.check(stats);
        if self.baseline.observe(stats) {
            if let Some(b) = self.baseline.frozen() {
                tracing::debug!(
                    "[TrafficSim] Baseline frozen: mean {:.2}ms, stddev {:.2}ms",
                    b.mean_rtt_ms,
                    b.rtt_stddev_ms
                );
            }
        }
        reason
    }

    fn check(&self, stats: &FlowStats) -> Option<AnomalyReason> {
        if stats.loss_percentage > LOSS_THRESHOLD_PCT {
            return Some(AnomalyReason::PacketLoss {
                pct: stats.loss_percentage,
            });
        }

        let baseline = self.baseline.frozen()?;
        if !stats.has_samples() {
            return None;
        }
        if baseline.mean_rtt_ms > 0.0 && stats.rtt.mean > LATENCY_FACTOR * baseline.mean_rtt_ms {
            return Some(AnomalyReason::HighLatency { ms: stats.rtt.mean });
        }
        if baseline.rtt_stddev_ms > 0.0
            && stats.rtt.stddev > JITTER_FACTOR * baseline.rtt_stddev_ms
        {
            return Some(AnomalyReason::JitterSpike {
                ms: stats.rtt.stddev,
            });
        }
        None
    }
}
