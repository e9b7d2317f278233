use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{RecordSink, RowError, SinkError};
use crate::sbs::SurveillanceRecord;

/// Scripted outcome for the next `insert_rows` call
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Reject the first row of the batch
    RejectFirstRow,
    /// Fail as if the connection dropped
    Transport,
}

/// In-process sink that keeps every accepted batch.
///
/// Failures can be scripted ahead of time so tests can exercise the retry
/// path without a real warehouse.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<SurveillanceRecord>>>,
    script: Mutex<VecDeque<ScriptedFailure>>,
    attempts: Mutex<u64>,
    /// Simulated warehouse latency per call
    delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `n` calls fail with `failure`
    pub fn fail_next(&self, n: usize, failure: ScriptedFailure) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.extend(std::iter::repeat_n(failure, n));
    }

    /// Batches accepted so far, in delivery order
    pub fn batches(&self) -> Vec<Vec<SurveillanceRecord>> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All accepted rows, flattened
    pub fn rows(&self) -> Vec<SurveillanceRecord> {
        self.batches().into_iter().flatten().collect()
    }

    /// Calls to `insert_rows`, successful or not
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl RecordSink for MemorySink {
    fn destination(&self) -> String {
        "memory".to_string()
    }

    async fn insert_rows(&self, rows: &[SurveillanceRecord]) -> Result<(), SinkError> {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(ScriptedFailure::RejectFirstRow) => Err(SinkError::Rejected(vec![RowError {
                index: 0,
                reason: "invalid: scripted rejection".to_string(),
            }])),
            Some(ScriptedFailure::Transport) => Err(SinkError::transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "scripted transport failure",
            ))),
            None => {
                self.batches
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(rows.to_vec());
                Ok(())
            }
        }
    }
}
