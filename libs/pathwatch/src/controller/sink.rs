// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Append-only destinations for results received over `probe_post`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::{AgentId, ProbeId, Result, ResultRecord};

pub trait ResultSink: Send + Sync {
    fn append(&self, record: ResultRecord) -> Result<()>;
}

/// Keeps every record in memory. Used by tests and when no file is configured.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<RwLock<Vec<ResultRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.read().clone()
    }

    pub fn records_for_probe(&self, probe_id: ProbeId) -> Vec<ResultRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.result.probe_id == probe_id)
            .cloned()
            .collect()
    }

    pub fn records_from_agent(&self, agent_id: AgentId) -> Vec<ResultRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ResultSink for MemorySink {
    fn append(&self, record: ResultRecord) -> Result<()> {
        self.records.write().push(record);
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!("[Controller] Writing results to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonLinesSink {
    fn append(&self, record: ResultRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProbeResult, ProbeType};
    use chrono::Utc;

    fn record(probe: u64, agent: u64) -> ResultRecord {
        ResultRecord {
            agent_id: AgentId(agent),
            received_at: Utc::now(),
            result: ProbeResult::new(
                ProbeId(probe),
                ProbeType::Ping,
                "10.0.0.1",
                AgentId::NONE,
                serde_json::json!({}),
            ),
        }
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new();
        sink.append(record(1, 10)).unwrap();
        sink.append(record(2, 10)).unwrap();
        sink.append(record(1, 11)).unwrap();
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.records_for_probe(ProbeId(1)).len(), 2);
        assert_eq!(sink.records_from_agent(AgentId(10)).len(), 2);
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();
        sink.append(record(1, 10)).unwrap();
        sink.append(record(2, 10)).unwrap();
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: ResultRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.result.probe_id, ProbeId(1));
        assert_eq!(first.agent_id, AgentId(10));
    }
}
