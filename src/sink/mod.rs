//! Boundary to the analytical store.
//!
//! The pipeline only needs one operation from the store: insert an ordered
//! list of rows, all or nothing from our point of view. Implementations report
//! per-row rejections or transport failures through [`SinkError`]; the
//! dispatcher treats either as "the whole batch goes back on the queue".

pub mod bigquery;
pub mod log;
pub mod memory;

pub use bigquery::{BigQuerySink, BigQuerySinkConfig};
pub use log::LogSink;
pub use memory::{MemorySink, ScriptedFailure};

use crate::sbs::SurveillanceRecord;

/// One row the store refused, by position in the submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub index: usize,
    pub reason: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.index, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The store answered but refused some or all rows
    #[error("sink rejected {} row(s), first: {}", .0.len(), first_row_error(.0))]
    Rejected(Vec<RowError>),
    /// The store answered with a non-success status
    #[error("sink returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The request never got a usable answer
    #[error("sink transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl SinkError {
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SinkError::Transport(Box::new(error))
    }

    /// Metric label for this failure
    pub fn label(&self) -> &'static str {
        match self {
            SinkError::Rejected(_) => "rejected",
            SinkError::Status { .. } => "status",
            SinkError::Transport(_) => "transport",
        }
    }
}

fn first_row_error(errors: &[RowError]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Bulk insert into the analytical store
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Identity of the destination (e.g. fully-qualified table), for logs
    fn destination(&self) -> String;

    /// Insert `rows` in order. `Ok` means every row was accepted.
    async fn insert_rows(&self, rows: &[SurveillanceRecord]) -> Result<(), SinkError>;
}
