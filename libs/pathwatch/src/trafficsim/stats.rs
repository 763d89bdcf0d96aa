// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Flow statistics derived from a closed cycle.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cycle::CycleSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    ClientToServer,
    ServerToClient,
}

/// Summary of a sample set, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Distribution {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Per-cycle report body for one direction of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub direction: FlowDirection,
    pub cycle: u64,
    pub start_seq: u64,
    pub end_seq: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub duration_ms: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub in_flight: u64,
    pub loss_percentage: f64,
    pub out_of_sequence: u64,
    pub duplicate_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt: Distribution,
    /// Absolute differences between consecutive round trips.
    pub jitter: Distribution,
}

impl FlowStats {
    pub fn from_summary(direction: FlowDirection, summary: &CycleSummary) -> Self {
        let rtts: Vec<f64> = summary
            .rtts
            .iter()
            .map(|d| d.as_secs_f64() * 1_000.0)
            .collect();
        let deltas: Vec<f64> = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).collect();

        let loss_percentage = if summary.packets_sent == 0 {
            0.0
        } else {
            summary.packets_lost as f64 / summary.packets_sent as f64 * 100.0
        };

        Self {
            direction,
            cycle: summary.cycle,
            start_seq: summary.start_seq,
            end_seq: summary.end_seq,
            window_start: summary.started_at,
            window_end: summary.closed_at,
            duration_ms: summary.duration.as_secs_f64() * 1_000.0,
            packets_sent: summary.packets_sent,
            packets_received: summary.packets_received,
            packets_lost: summary.packets_lost,
            in_flight: summary.in_flight,
            loss_percentage,
            out_of_sequence: summary.out_of_sequence,
            duplicate_count: summary.duplicates,
            bytes_sent: summary.bytes_sent,
            bytes_received: summary.bytes_received,
            rtt: Distribution::from_samples(&rtts),
            jitter: Distribution::from_samples(&deltas),
        }
    }

    /// A cycle that received nothing is excluded from the baseline.
    pub fn has_samples(&self) -> bool {
        self.packets_received > 0
    }
}

/// Sequence numbers kept across windows for duplicate detection.
const SEEN_HORIZON: u64 = 4_096;

/// What a receiver saw of a peer's DATA stream during one cycle.
///
/// HELLO shares the sender's sequence space; `skip` marks those numbers so
/// a re-handshake does not show up as gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiveCounters {
    pub received: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    /// Sequence numbers below the highest seen that have not arrived.
    pub gaps: u64,
    pub bytes: u64,
    pub highest_seq: Option<u64>,
    #[serde(skip)]
    seen: BTreeSet<u64>,
    /// Sequences below this have aged out of `seen` and count as duplicates.
    #[serde(skip)]
    floor: Option<u64>,
}

impl ReceiveCounters {
    pub fn observe(&mut self, seq: u64, bytes: usize) {
        if !self.mark(seq) {
            self.duplicates += 1;
            return;
        }
        self.received += 1;
        self.bytes += bytes as u64;
        if self.advance(seq) {
            self.out_of_order += 1;
        }
    }

    /// Account for a sequence number that carried no DATA.
    pub fn skip(&mut self, seq: u64) {
        if self.mark(seq) {
            self.advance(seq);
        }
    }

    /// `false` when `seq` was already seen or is too old to tell.
    fn mark(&mut self, seq: u64) -> bool {
        if self.floor.is_some_and(|floor| seq < floor) {
            return false;
        }
        self.seen.insert(seq)
    }

    /// Move the high-water mark. `true` when `seq` filled an earlier gap.
    fn advance(&mut self, seq: u64) -> bool {
        match self.highest_seq {
            None => {
                self.highest_seq = Some(seq);
                false
            }
            Some(highest) if seq > highest => {
                self.gaps += seq - highest - 1;
                self.highest_seq = Some(seq);
                false
            }
            Some(_) => {
                self.gaps = self.gaps.saturating_sub(1);
                true
            }
        }
    }

    /// Return the counters so far and start a fresh window. The new window
    /// keeps recent sequence numbers so late duplicates are still caught.
    pub fn take(&mut self) -> ReceiveCounters {
        let mut snapshot = std::mem::take(self);
        if let Some(highest) = snapshot.highest_seq {
            let floor = highest.saturating_sub(SEEN_HORIZON);
            self.highest_seq = Some(highest);
            self.seen = snapshot.seen.split_off(&floor);
            self.floor = Some(floor.max(snapshot.floor.unwrap_or(0)));
        }
        snapshot.seen.clear();
        snapshot
    }
}
