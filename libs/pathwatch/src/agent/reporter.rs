// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::ProbeResult;

/// Producer handle onto the bounded result queue drained by the control
/// channel writer. Reporting never blocks; a full queue drops the result.
#[derive(Debug, Clone)]
pub struct ResultReporter {
    tx: mpsc::Sender<ProbeResult>,
}

impl ResultReporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProbeResult>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` when the result was dropped.
    pub fn report(&self, result: ProbeResult) -> bool {
        match self.tx.try_send(result) {
            Ok(()) => true,
            Err(TrySendError::Full(result)) => {
                tracing::warn!(
                    "[Agent] Result queue full, dropping {} result for probe {}",
                    result.probe_type,
                    result.probe_id
                );
                false
            }
            Err(TrySendError::Closed(result)) => {
                tracing::debug!(
                    "[Agent] Result queue closed, dropping result for probe {}",
                    result.probe_id
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentId, ProbeId, ProbeType};

    fn result(id: u64) -> ProbeResult {
        ProbeResult::new(
            ProbeId(id),
            ProbeType::Ping,
            "10.0.0.1",
            AgentId::NONE,
            serde_json::Value::Null,
        )
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (reporter, mut rx) = ResultReporter::channel(2);
        assert!(reporter.report(result(1)));
        assert!(reporter.report(result(2)));
        assert!(!reporter.report(result(3)));

        assert_eq!(rx.recv().await.unwrap().probe_id, ProbeId(1));
        assert!(reporter.report(result(4)));
        assert_eq!(rx.recv().await.unwrap().probe_id, ProbeId(2));
        assert_eq!(rx.recv().await.unwrap().probe_id, ProbeId(4));
    }

    #[test]
    fn test_closed_queue_reports_drop() {
        let (reporter, rx) = ResultReporter::channel(1);
        drop(rx);
        assert!(!reporter.report(result(1)));
    }
}
