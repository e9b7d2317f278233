//! Pipeline controller: owns the queue, the source connector and the
//! dispatcher, and starts and stops them as one unit.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::ingest_queue::{BackpressurePolicy, IngestQueue};
use crate::pipeline_stats::{CounterSnapshot, PipelineCounters};
use crate::queue_config::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::sbs::{ConnectionState, SourceConfig, SourceConnector, SourceHealth};
use crate::sink::RecordSink;

/// Queue and streaming settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// `None` for an unbounded queue
    pub queue_capacity: Option<usize>,
    pub backpressure: BackpressurePolicy,
    pub dispatcher: DispatcherConfig,
    /// Wait in `stop()` before an in-flight send is interrupted and re-queued
    pub shutdown_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            backpressure: BackpressurePolicy::default(),
            dispatcher: DispatcherConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PipelineSettings {
    fn validate(&self, source: &SourceConfig) -> Result<()> {
        if self.dispatcher.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.queue_capacity == Some(0) {
            bail!("queue capacity must be greater than 0 when set");
        }
        if source.host.trim().is_empty() {
            bail!("source host must not be empty");
        }
        if source.port == 0 {
            bail!("source port must not be 0");
        }
        if source.read_timeout.is_zero() {
            bail!("source read timeout must be greater than 0");
        }
        Ok(())
    }
}

/// Snapshot returned by [`Pipeline::status`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub queue_depth: usize,
    /// Records accepted per second over the current (or last) run
    pub throughput: f64,
    pub source: SourceHealth,
}

/// Summary logged and returned by [`Pipeline::stop`]
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    /// Records left in the queue; delivered after the next start
    pub queue_depth: usize,
}

struct RunningTasks {
    cancel: CancellationToken,
    hard_stop: CancellationToken,
    source: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

#[derive(Default)]
struct RunState {
    tasks: Option<RunningTasks>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    /// Length of the last finished run, so status stays meaningful after stop
    final_elapsed: Option<Duration>,
}

/// The ingestion pipeline: SBS source to sink
pub struct Pipeline {
    settings: PipelineSettings,
    source: Arc<SourceConnector>,
    sink: Arc<dyn RecordSink>,
    queue: IngestQueue,
    counters: Arc<PipelineCounters>,
    /// Held for the whole of start/stop; `state` is only held briefly so
    /// status readers never wait on a shutdown.
    lifecycle: Mutex<()>,
    state: Mutex<RunState>,
}

impl Pipeline {
    /// Validate the settings and build an idle pipeline
    pub fn new(
        settings: PipelineSettings,
        source: SourceConfig,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        settings.validate(&source)?;

        let queue = IngestQueue::new(settings.queue_capacity, settings.backpressure);
        Ok(Self {
            settings,
            source: Arc::new(SourceConnector::new(source)),
            sink,
            queue,
            counters: Arc::new(PipelineCounters::default()),
            lifecycle: Mutex::new(()),
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    /// Start reading and delivering. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let mut state = self.state.lock().await;
        if state.tasks.is_some() {
            return false;
        }

        self.counters.reset();
        let cancel = CancellationToken::new();
        let hard_stop = CancellationToken::new();

        let source = {
            let connector = self.source.clone();
            let queue = self.queue.clone();
            let counters = self.counters.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run(queue, counters, cancel).await })
        };

        let dispatcher = Dispatcher::new(
            self.settings.dispatcher.clone(),
            self.queue.clone(),
            self.sink.clone(),
            self.counters.clone(),
        )
        .with_hard_stop(hard_stop.clone());
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

        state.tasks = Some(RunningTasks {
            cancel,
            hard_stop,
            source,
            dispatcher,
        });
        state.started_at = Some(Utc::now());
        state.started = Some(Instant::now());
        state.final_elapsed = None;
        metrics::gauge!("pipeline.running").set(1.0);

        info!(
            "Pipeline started: source={}, sink={}, queue={}",
            self.source.config().endpoint(),
            self.sink.destination(),
            self.queue
                .capacity()
                .map(|c| format!("{} ({})", c, self.queue.policy()))
                .unwrap_or_else(|| "unbounded".to_string())
        );
        true
    }

    /// Stop both loops and return the run summary. `None` if not running.
    ///
    /// Each loop gets `shutdown_timeout` to finish on its own. After that an
    /// in-flight sink call is interrupted and its batch goes back on the queue.
    pub async fn stop(&self) -> Option<RunSummary> {
        let _lifecycle = self.lifecycle.lock().await;
        let (tasks, started_at, started) = {
            let mut state = self.state.lock().await;
            let tasks = state.tasks.take()?;
            state.final_elapsed = state.started.map(|s| s.elapsed());
            (tasks, state.started_at, state.started)
        };

        info!("Stopping pipeline...");
        tasks.cancel.cancel();
        tokio::join!(
            self.join_or_abort("source connector", tasks.source, None),
            self.join_or_abort("dispatcher", tasks.dispatcher, Some(&tasks.hard_stop)),
        );

        let elapsed = started.map(|s| s.elapsed()).unwrap_or_default();
        self.state.lock().await.final_elapsed = Some(elapsed);
        metrics::gauge!("pipeline.running").set(0.0);

        let summary = RunSummary {
            started_at: started_at.unwrap_or_else(Utc::now),
            stopped_at: Utc::now(),
            elapsed_seconds: elapsed.as_secs_f64(),
            counters: self.counters.snapshot(),
            queue_depth: self.queue.size(),
        };
        info!(
            "Pipeline stopped after {:.1}s: {} records processed, {} delivered, {} batches retried, {} left in queue",
            summary.elapsed_seconds,
            summary.counters.records_enqueued,
            summary.counters.records_delivered,
            summary.counters.batches_failed,
            summary.queue_depth
        );
        Some(summary)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.tasks.is_some()
    }

    /// Running and connected to the source
    pub async fn is_healthy(&self) -> bool {
        self.is_running().await
            && self.source.health().read().await.state == ConnectionState::Connected
    }

    pub async fn status(&self) -> PipelineStatus {
        let (running, started_at, elapsed) = {
            let state = self.state.lock().await;
            let elapsed = match (state.tasks.is_some(), state.started, state.final_elapsed) {
                (true, Some(started), _) => started.elapsed(),
                (_, _, Some(final_elapsed)) => final_elapsed,
                _ => Duration::ZERO,
            };
            (state.tasks.is_some(), state.started_at, elapsed)
        };

        let counters = self.counters.snapshot();
        let elapsed_seconds = elapsed.as_secs_f64();
        let throughput = if elapsed_seconds > 0.0 {
            counters.records_enqueued as f64 / elapsed_seconds
        } else {
            0.0
        };

        PipelineStatus {
            running,
            started_at,
            elapsed_seconds,
            counters,
            queue_depth: self.queue.size(),
            throughput,
            source: self.source.health().read().await.clone(),
        }
    }

    async fn join_or_abort(
        &self,
        name: &str,
        mut handle: JoinHandle<()>,
        hard_stop: Option<&CancellationToken>,
    ) {
        let timeout = self.settings.shutdown_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!("{} task ended abnormally: {}", name, e);
                return;
            }
            Err(_) => {}
        }

        if let Some(hard_stop) = hard_stop {
            warn!(
                "{} did not stop within {}ms, interrupting in-flight work",
                name,
                timeout.as_millis()
            );
            hard_stop.cancel();
            // Covers a batch still being collected when the token fired
            let grace = self.settings.dispatcher.max_wait + Duration::from_secs(1);
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    warn!("{} task ended abnormally: {}", name, e);
                    return;
                }
                Err(_) => {}
            }
        }

        warn!("{} did not stop within {}ms, aborting", name, timeout.as_millis());
        handle.abort();
    }
}
