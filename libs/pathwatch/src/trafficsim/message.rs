// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! TrafficSim datagram codec (MessagePack via `rmp-serde`).

use serde::{Deserialize, Serialize};

use crate::core::{AgentId, PathwatchError, Result};

use super::stats::ReceiveCounters;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Hello,
    Ack,
    Data,
    Ping,
    Pong,
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub src: AgentId,
    pub dst: AgentId,
    pub seq: u64,
    /// Sender wall clock in microseconds since the Unix epoch. Echoed back in
    /// ACK and PONG replies.
    pub timestamp_us: i64,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, src: AgentId, dst: AgentId, seq: u64) -> Self {
        Self {
            kind,
            src,
            dst,
            seq,
            timestamp_us: chrono::Utc::now().timestamp_micros(),
            payload: Vec::new(),
        }
    }

    pub fn hello(src: AgentId, dst: AgentId, seq: u64) -> Self {
        Self::new(MessageKind::Hello, src, dst, seq)
    }

    pub fn data(src: AgentId, dst: AgentId, seq: u64, padding: usize) -> Self {
        Self {
            payload: vec![0; padding],
            ..Self::new(MessageKind::Data, src, dst, seq)
        }
    }

    pub fn ping(src: AgentId, dst: AgentId, seq: u64) -> Self {
        Self::new(MessageKind::Ping, src, dst, seq)
    }

    /// A reply of `kind` to this message, from `src`, echoing seq and timestamp.
    pub fn reply(&self, kind: MessageKind, src: AgentId) -> Self {
        Self {
            kind,
            src,
            dst: self.src,
            seq: self.seq,
            timestamp_us: self.timestamp_us,
            payload: Vec::new(),
        }
    }

    /// A REPORT carrying the sender's receive counters.
    pub fn report(src: AgentId, dst: AgentId, seq: u64, counters: &ReceiveCounters) -> Result<Self> {
        Ok(Self {
            payload: rmp_serde::to_vec_named(counters)?,
            ..Self::new(MessageKind::Report, src, dst, seq)
        })
    }

    pub fn report_counters(&self) -> Result<ReceiveCounters> {
        if self.kind != MessageKind::Report {
            return Err(PathwatchError::Protocol(format!(
                "{:?} does not carry receive counters",
                self.kind
            )));
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = rmp_serde::to_vec_named(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(PathwatchError::Codec(format!(
                "datagram of {} bytes exceeds {}",
                bytes.len(),
                MAX_DATAGRAM
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_echoes_sequence_and_timestamp() {
        let data = Message::data(AgentId(1), AgentId(2), 41, 16);
        let ack = data.reply(MessageKind::Ack, AgentId(2));
        assert_eq!(ack.seq, 41);
        assert_eq!(ack.timestamp_us, data.timestamp_us);
        assert_eq!(ack.dst, AgentId(1));
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn test_data_padding_survives_codec() {
        let data = Message::data(AgentId(1), AgentId(2), 7, 64);
        let decoded = Message::decode(&data.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Data);
        assert_eq!(decoded.payload.len(), 64);
    }

    #[test]
    fn test_report_carries_counters() {
        let mut counters = ReceiveCounters::default();
        counters.observe(1, 10);
        counters.observe(3, 10);
        let msg = Message::report(AgentId(2), AgentId(1), 0, &counters).unwrap();
        let back = Message::decode(&msg.encode().unwrap())
            .unwrap()
            .report_counters()
            .unwrap();
        assert_eq!(back.received, 2);
        assert_eq!(back.gaps, 1);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Message::decode(b"\xff\x00garbage").is_err());
        let ping = Message::ping(AgentId(1), AgentId(2), 0);
        assert!(ping.report_counters().is_err());
    }
}
