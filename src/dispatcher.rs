use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest_queue::IngestQueue;
use crate::pipeline_stats::PipelineCounters;
use crate::queue_config::{DEFAULT_BATCH_MAX_WAIT, DEFAULT_BATCH_SIZE, DEFAULT_FAILURE_BACKOFF};
use crate::sink::RecordSink;

/// Batching knobs for the dispatcher loop
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    /// Longest wait to fill one batch
    pub max_wait: Duration,
    /// Pause after a failed sink call
    pub failure_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: DEFAULT_BATCH_MAX_WAIT,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// Drains the ingest queue into batches and hands them to the sink.
///
/// A failed batch goes back on the queue whole, so delivery is at-least-once.
/// The same holds for a send cut short by the hard-stop token.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: IngestQueue,
    sink: Arc<dyn RecordSink>,
    counters: Arc<PipelineCounters>,
    hard_stop: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: IngestQueue,
        sink: Arc<dyn RecordSink>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            config,
            queue,
            sink,
            counters,
            hard_stop: CancellationToken::new(),
        }
    }

    /// Token that abandons an in-flight sink call. The batch is re-queued.
    pub fn with_hard_stop(mut self, hard_stop: CancellationToken) -> Self {
        self.hard_stop = hard_stop;
        self
    }

    /// Loop until `cancel` fires. A sink call already in flight is allowed to
    /// finish unless the hard-stop token fires first.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting dispatcher: batch_size={}, max_wait={}ms, sink={}",
            self.config.batch_size,
            self.config.max_wait.as_millis(),
            self.sink.destination()
        );

        while !cancel.is_cancelled() {
            // Not raced against the token: a half-collected batch would be lost.
            // The wait is bounded by max_wait anyway.
            let batch = self
                .queue
                .dequeue_batch(self.config.batch_size, self.config.max_wait)
                .await;

            if batch.is_empty() {
                continue;
            }

            if !self.send_batch(batch).await {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.failure_backoff) => {}
                }
            }
        }

        if self.queue.is_empty() {
            info!("Dispatcher stopped with queue drained");
        } else {
            info!("Dispatcher stopped with {} records still queued", self.queue.size());
        }
    }

    /// Deliver one batch. Returns whether the sink accepted it.
    async fn send_batch(&self, batch: Vec<crate::sbs::SurveillanceRecord>) -> bool {
        let batch_size = batch.len();
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = self.hard_stop.cancelled() => None,
            result = self.sink.insert_rows(&batch) => Some(result),
        };

        let Some(result) = result else {
            warn!(
                "Stop interrupted delivery of {} records to {} - re-queueing",
                batch_size,
                self.sink.destination()
            );
            self.queue.requeue(batch);
            PipelineCounters::add(&self.counters.records_requeued, batch_size as u64);
            counter!("dispatcher.batches_interrupted_total").increment(1);
            return false;
        };

        match result {
            Ok(()) => {
                let duration = start.elapsed();
                PipelineCounters::add(&self.counters.records_delivered, batch_size as u64);
                PipelineCounters::add(&self.counters.batches_delivered, 1);
                counter!("dispatcher.records_delivered_total").increment(batch_size as u64);
                counter!("dispatcher.batches_delivered_total").increment(1);
                histogram!("dispatcher.batch_size").record(batch_size as f64);
                histogram!("dispatcher.batch_duration_ms").record(duration.as_millis() as f64);

                debug!(
                    "Delivered batch of {} records to {} in {:.1}ms",
                    batch_size,
                    self.sink.destination(),
                    duration.as_secs_f64() * 1000.0
                );
                true
            }
            Err(e) => {
                let sample = batch
                    .first()
                    .and_then(|record| serde_json::to_string(record).ok())
                    .unwrap_or_default();
                match &e {
                    crate::sink::SinkError::Rejected(_) => error!(
                        "Sink {} rejected batch of {} records: {} - re-queueing. Sample record: {}",
                        self.sink.destination(),
                        batch_size,
                        e,
                        sample
                    ),
                    _ => warn!(
                        "Failed to deliver batch of {} records to {}: {} - re-queueing. Sample record: {}",
                        batch_size,
                        self.sink.destination(),
                        e,
                        sample
                    ),
                }

                self.queue.requeue(batch);
                PipelineCounters::add(&self.counters.batches_failed, 1);
                PipelineCounters::add(&self.counters.records_requeued, batch_size as u64);
                counter!("dispatcher.batches_failed_total", "reason" => e.label()).increment(1);
                false
            }
        }
    }
}
