// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-cycle packet bookkeeping.
//!
//! Nothing here reads the clock: every operation takes the `Instant` it
//! happens at, so the bookkeeping can be driven deterministically.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
struct PacketRecord {
    sent_at: Instant,
    bytes: usize,
    acked: bool,
    /// Set only for acknowledgements that arrived within the packet timeout.
    rtt: Option<Duration>,
}

/// What an acknowledgement did to the cycle it landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted {
        rtt: Duration,
        out_of_sequence: bool,
    },
    /// Arrived after the packet timeout; the packet stays lost.
    Late,
    Duplicate,
    /// Sequence not part of any open cycle.
    OutOfCycle,
}

impl AckOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AckOutcome::Accepted { .. })
    }
}

/// Raw figures of a closed cycle, before statistics are derived.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub start_seq: u64,
    pub end_seq: u64,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration: Duration,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub in_flight: u64,
    pub duplicates: u64,
    pub out_of_sequence: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Round-trip times of accepted packets, in sequence order.
    pub rtts: Vec<Duration>,
}

/// One cycle of `capacity` consecutive sequence numbers.
#[derive(Debug)]
pub struct CycleTracker {
    cycle: u64,
    start_seq: u64,
    capacity: u32,
    packet_timeout: Duration,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    packets: BTreeMap<u64, PacketRecord>,
    highest_acked: Option<u64>,
    duplicates: u64,
    out_of_sequence: u64,
}

impl CycleTracker {
    pub fn new(
        cycle: u64,
        start_seq: u64,
        capacity: u32,
        packet_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            cycle,
            start_seq,
            capacity: capacity.max(1),
            packet_timeout,
            started_at: now,
            started_wall: Utc::now(),
            packets: BTreeMap::new(),
            highest_acked: None,
            duplicates: 0,
            out_of_sequence: 0,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    pub fn end_seq(&self) -> u64 {
        self.start_seq + u64::from(self.capacity) - 1
    }

    pub fn contains(&self, seq: u64) -> bool {
        (self.start_seq..=self.end_seq()).contains(&seq)
    }

    pub fn sent(&self) -> u32 {
        self.packets.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.sent() >= self.capacity
    }

    /// Record a send. Returns `false` for a sequence outside the cycle or one
    /// already sent.
    pub fn record_sent(&mut self, seq: u64, bytes: usize, at: Instant) -> bool {
        if !self.contains(seq) || self.packets.contains_key(&seq) {
            return false;
        }
        self.packets.insert(
            seq,
            PacketRecord {
                sent_at: at,
                bytes,
                acked: false,
                rtt: None,
            },
        );
        true
    }

    pub fn record_ack(&mut self, seq: u64, at: Instant) -> AckOutcome {
        if !self.contains(seq) {
            return AckOutcome::OutOfCycle;
        }
        let Some(packet) = self.packets.get_mut(&seq) else {
            return AckOutcome::OutOfCycle;
        };
        if packet.acked {
            self.duplicates += 1;
            return AckOutcome::Duplicate;
        }
        packet.acked = true;

        let rtt = at.saturating_duration_since(packet.sent_at);
        if rtt > self.packet_timeout {
            return AckOutcome::Late;
        }
        packet.rtt = Some(rtt);

        let out_of_sequence = self.highest_acked.is_some_and(|h| seq < h);
        if out_of_sequence {
            self.out_of_sequence += 1;
        }
        self.highest_acked = Some(self.highest_acked.map_or(seq, |h| h.max(seq)));
        AckOutcome::Accepted {
            rtt,
            out_of_sequence,
        }
    }

    /// Full, and every packet is either acknowledged or past its timeout.
    pub fn is_resolved(&self, now: Instant) -> bool {
        self.is_full()
            && self.packets.values().all(|p| {
                p.acked || now.saturating_duration_since(p.sent_at) >= self.packet_timeout
            })
    }

    pub fn is_expired(&self, now: Instant, hard_timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= hard_timeout
    }

    pub fn close(self, now: Instant) -> CycleSummary {
        let mut summary = CycleSummary {
            cycle: self.cycle,
            start_seq: self.start_seq,
            end_seq: self
                .packets
                .keys()
                .next_back()
                .copied()
                .unwrap_or(self.start_seq),
            started_at: self.started_wall,
            closed_at: Utc::now(),
            duration: now.saturating_duration_since(self.started_at),
            packets_sent: self.packets.len() as u64,
            packets_received: 0,
            packets_lost: 0,
            in_flight: 0,
            duplicates: self.duplicates,
            out_of_sequence: self.out_of_sequence,
            bytes_sent: 0,
            bytes_received: 0,
            rtts: Vec::new(),
        };

        for packet in self.packets.values() {
            summary.bytes_sent += packet.bytes as u64;
            if let Some(rtt) = packet.rtt {
                summary.packets_received += 1;
                summary.bytes_received += packet.bytes as u64;
                summary.rtts.push(rtt);
            } else if packet.acked
                || now.saturating_duration_since(packet.sent_at) >= self.packet_timeout
            {
                summary.packets_lost += 1;
            } else {
                summary.in_flight += 1;
            }
        }
        summary
    }
}

/// The open cycle plus the previous one while it drains late replies.
///
/// Summaries come out in cycle-start order.
#[derive(Debug)]
pub struct CycleWindow {
    capacity: u32,
    packet_timeout: Duration,
    hard_timeout: Duration,
    next_cycle: u64,
    current: Option<CycleTracker>,
    draining: Option<CycleTracker>,
}

impl CycleWindow {
    pub fn new(capacity: u32, packet_timeout: Duration, hard_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            packet_timeout,
            hard_timeout,
            next_cycle: 1,
            current: None,
            draining: None,
        }
    }

    pub fn current_cycle(&self) -> Option<u64> {
        self.current.as_ref().map(CycleTracker::cycle)
    }

    /// Record a send, rotating a full cycle into the drain slot first. A cycle
    /// still draining at that point is closed and returned.
    pub fn record_sent(&mut self, seq: u64, bytes: usize, now: Instant) -> Vec<CycleSummary> {
        let mut closed = Vec::new();

        if self.current.as_ref().is_some_and(CycleTracker::is_full) {
            if let Some(previous) = self.draining.take() {
                closed.push(previous.close(now));
            }
            self.draining = self.current.take();
        }

        let current = self.current.get_or_insert_with(|| {
            let cycle = self.next_cycle;
            self.next_cycle += 1;
            CycleTracker::new(cycle, seq, self.capacity, self.packet_timeout, now)
        });
        current.record_sent(seq, bytes, now);
        closed
    }

    pub fn record_ack(&mut self, seq: u64, now: Instant) -> AckOutcome {
        if let Some(current) = self.current.as_mut().filter(|c| c.contains(seq)) {
            return current.record_ack(seq, now);
        }
        if let Some(draining) = self.draining.as_mut().filter(|c| c.contains(seq)) {
            return draining.record_ack(seq, now);
        }
        AckOutcome::OutOfCycle
    }

    /// Close whatever is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<CycleSummary> {
        let mut closed = Vec::new();

        if self.draining.as_ref().is_some_and(|d| d.is_resolved(now)) {
            if let Some(draining) = self.draining.take() {
                closed.push(draining.close(now));
            }
        }

        let current_due = self.current.as_ref().is_some_and(|c| {
            c.is_expired(now, self.hard_timeout) || (self.draining.is_none() && c.is_resolved(now))
        });
        if current_due {
            if let Some(draining) = self.draining.take() {
                closed.push(draining.close(now));
            }
            if let Some(current) = self.current.take() {
                closed.push(current.close(now));
            }
        }
        closed
    }

    /// Close everything that has at least one packet sent.
    pub fn flush(&mut self, now: Instant) -> Vec<CycleSummary> {
        [self.draining.take(), self.current.take()]
            .into_iter()
            .flatten()
            .filter(|c| c.sent() > 0)
            .map(|c| c.close(now))
            .collect()
    }
}
