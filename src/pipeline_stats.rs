use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run counters shared by the source loop, the dispatcher and status callers
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Complete lines read from the source, before filtering
    pub lines_received: AtomicU64,
    /// `MSG` lines the parser refused
    pub lines_rejected: AtomicU64,
    /// Records parsed and handed to the queue ("messages processed")
    pub records_enqueued: AtomicU64,
    /// Records refused by a full queue under the drop policy
    pub records_dropped: AtomicU64,
    pub records_delivered: AtomicU64,
    pub batches_delivered: AtomicU64,
    /// Failed sink calls, each one a full-batch retry
    pub batches_failed: AtomicU64,
    pub records_requeued: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub lines_received: u64,
    pub lines_rejected: u64,
    pub records_enqueued: u64,
    pub records_dropped: u64,
    pub records_delivered: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub records_requeued: u64,
}

impl PipelineCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            lines_rejected: self.lines_rejected.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_requeued: self.records_requeued.load(Ordering::Relaxed),
        }
    }

    /// Zero everything; called when a new run starts
    pub fn reset(&self) {
        for counter in [
            &self.lines_received,
            &self.lines_rejected,
            &self.records_enqueued,
            &self.records_dropped,
            &self.records_delivered,
            &self.batches_delivered,
            &self.batches_failed,
            &self.records_requeued,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
