//! Ingest queue between the source connector and the dispatcher.
//!
//! A flume channel carries the records. The optional capacity is enforced on
//! the producer side ([`IngestQueue::enqueue`]) rather than by the channel
//! itself, so the retry path ([`IngestQueue::requeue`]) can always put a failed
//! batch back even when the queue is full. The dispatcher is the only consumer
//! and must never wait on space that only it can free.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::queue_config::queue_warning_threshold;
use crate::sbs::SurveillanceRecord;

/// What `enqueue` does when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait until the dispatcher frees space
    #[default]
    Block,
    /// Discard the incoming record and count it
    DropNewest,
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressurePolicy::Block => write!(f, "block"),
            BackpressurePolicy::DropNewest => write!(f, "drop_newest"),
        }
    }
}

struct Shared {
    capacity: Option<usize>,
    policy: BackpressurePolicy,
    dropped: AtomicU64,
    space_available: Notify,
}

/// FIFO of parsed records; cheap to clone, all clones share one queue
#[derive(Clone)]
pub struct IngestQueue {
    tx: flume::Sender<SurveillanceRecord>,
    rx: flume::Receiver<SurveillanceRecord>,
    shared: Arc<Shared>,
}

impl IngestQueue {
    /// Queue without a size cap
    pub fn unbounded() -> Self {
        Self::new(None, BackpressurePolicy::default())
    }

    /// `capacity: None` means unbounded, in which case `policy` never applies
    pub fn new(capacity: Option<usize>, policy: BackpressurePolicy) -> Self {
        let (tx, rx) = flume::unbounded();
        metrics::gauge!("ingest_queue.depth").set(0.0);
        Self {
            tx,
            rx,
            shared: Arc::new(Shared {
                capacity,
                policy,
                dropped: AtomicU64::new(0),
                space_available: Notify::new(),
            }),
        }
    }

    /// Add a freshly parsed record at the back of the queue.
    ///
    /// Returns `false` only when the queue is bounded, full, and configured to
    /// drop. Under `Block` this waits for the dispatcher to drain.
    pub async fn enqueue(&self, record: SurveillanceRecord) -> bool {
        if let Some(capacity) = self.shared.capacity {
            match self.shared.policy {
                BackpressurePolicy::DropNewest => {
                    if self.tx.len() >= capacity {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("ingest_queue.dropped_total").increment(1);
                        debug!(
                            "Ingest queue full ({} records), dropping record for {:?}",
                            capacity, record.aircraft_id
                        );
                        return false;
                    }
                }
                BackpressurePolicy::Block => self.wait_for_space(capacity).await,
            }
        }

        self.push(record);
        true
    }

    /// Put records from a failed batch back at the back of the queue.
    ///
    /// Ignores the capacity: these records were already admitted once.
    pub fn requeue(&self, records: Vec<SurveillanceRecord>) {
        let count = records.len();
        for record in records {
            self.push(record);
        }
        metrics::counter!("ingest_queue.requeued_total").increment(count as u64);
    }

    /// Remove up to `max_n` records.
    ///
    /// Waits at most `max_wait` in total: for the first record, then for more
    /// until the batch is full or the deadline passes. Returns an empty vec
    /// when nothing arrived in time.
    pub async fn dequeue_batch(&self, max_n: usize, max_wait: Duration) -> Vec<SurveillanceRecord> {
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_n.min(1024));

        while batch.len() < max_n {
            match self.rx.try_recv() {
                Ok(record) => {
                    batch.push(record);
                    continue;
                }
                Err(flume::TryRecvError::Empty) => {}
                Err(flume::TryRecvError::Disconnected) => break,
            }

            match tokio::time::timeout_at(deadline, self.rx.recv_async()).await {
                Ok(Ok(record)) => batch.push(record),
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if !batch.is_empty() {
            self.shared.space_available.notify_waiters();
            self.record_depth();
        }
        batch
    }

    /// Current number of queued records
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.shared.policy
    }

    /// Records discarded by `DropNewest` since the queue was created
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, record: SurveillanceRecord) {
        // The queue owns its receiver, so the channel can't be disconnected
        if self.tx.send(record).is_err() {
            warn!("Ingest queue receiver gone, record lost");
        }
        self.record_depth();
    }

    async fn wait_for_space(&self, capacity: usize) {
        loop {
            let notified = self.shared.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.tx.len() < capacity {
                return;
            }
            notified.await;
        }
    }

    fn record_depth(&self) {
        let depth = self.rx.len();
        metrics::gauge!("ingest_queue.depth").set(depth as f64);
        if let Some(capacity) = self.shared.capacity
            && depth > 0
            && depth == queue_warning_threshold(capacity)
        {
            warn!(
                "Ingest queue is 80% full ({} / {} records) - sink may be falling behind",
                depth, capacity
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbs::parse_sbs_line;

    fn record(hex: &str) -> SurveillanceRecord {
        let line = format!(
            "MSG,3,1,1,{hex},1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,,35000,,,40.0,-74.0,,,0,0,0,0"
        );
        parse_sbs_line(&line).unwrap()
    }

    fn ids(batch: &[SurveillanceRecord]) -> Vec<String> {
        batch
            .iter()
            .map(|r| r.aircraft_id.clone().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn test_empty_queue_returns_within_wait_bound() {
        let queue = IngestQueue::unbounded();
        let start = std::time::Instant::now();

        let batch = queue.dequeue_batch(100, Duration::from_millis(200)).await;

        let elapsed = start.elapsed();
        assert!(batch.is_empty());
        assert!(elapsed >= Duration::from_millis(190), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "blocked too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_fifo_and_batch_size_limit() {
        let queue = IngestQueue::unbounded();
        for hex in ["A00001", "A00002", "A00003", "A00004", "A00005"] {
            assert!(queue.enqueue(record(hex)).await);
        }
        assert_eq!(queue.size(), 5);

        let first = queue.dequeue_batch(3, Duration::from_millis(100)).await;
        assert_eq!(ids(&first), vec!["A00001", "A00002", "A00003"]);

        let second = queue.dequeue_batch(3, Duration::from_millis(100)).await;
        assert_eq!(ids(&second), vec!["A00004", "A00005"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_returns_at_deadline() {
        let queue = IngestQueue::unbounded();
        queue.enqueue(record("A00001")).await;

        let start = std::time::Instant::now();
        let batch = queue.dequeue_batch(100, Duration::from_millis(150)).await;

        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_waits_for_first_record() {
        let queue = IngestQueue::unbounded();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.enqueue(record("B00001")).await;
        });

        let batch = queue.dequeue_batch(1, Duration::from_secs(2)).await;
        assert_eq!(ids(&batch), vec!["B00001"]);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_back() {
        let queue = IngestQueue::unbounded();
        queue.enqueue(record("A00001")).await;
        queue.enqueue(record("A00002")).await;

        let failed = queue.dequeue_batch(1, Duration::from_millis(50)).await;
        queue.enqueue(record("A00003")).await;
        queue.requeue(failed);

        let rest = queue.dequeue_batch(10, Duration::from_millis(50)).await;
        assert_eq!(ids(&rest), vec!["A00002", "A00003", "A00001"]);
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() {
        let queue = IngestQueue::new(Some(2), BackpressurePolicy::DropNewest);
        assert!(queue.enqueue(record("A00001")).await);
        assert!(queue.enqueue(record("A00002")).await);
        assert!(!queue.enqueue(record("A00003")).await);

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_requeue_ignores_capacity() {
        let queue = IngestQueue::new(Some(2), BackpressurePolicy::DropNewest);
        queue.enqueue(record("A00001")).await;
        queue.enqueue(record("A00002")).await;

        let failed = queue.dequeue_batch(2, Duration::from_millis(50)).await;
        queue.enqueue(record("A00003")).await;
        queue.enqueue(record("A00004")).await;
        queue.requeue(failed);

        assert_eq!(queue.size(), 4);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_drain() {
        let queue = IngestQueue::new(Some(1), BackpressurePolicy::Block);
        queue.enqueue(record("A00001")).await;

        let producer = queue.clone();
        let blocked = tokio::spawn(async move { producer.enqueue(record("A00002")).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let first = queue.dequeue_batch(1, Duration::from_millis(50)).await;
        assert_eq!(ids(&first), vec!["A00001"]);

        let accepted = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer should be released")
            .unwrap();
        assert!(accepted);
        assert_eq!(queue.size(), 1);
    }
}
