use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use adsb_bridge::config::BridgeConfig;
use adsb_bridge::metrics::{init_metrics, initialize_bridge_metrics, start_metrics_server};
use adsb_bridge::pipeline::Pipeline;

/// Command-line values that win over the config file
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub batch_size: Option<usize>,
    pub metrics_port: Option<u16>,
}

impl RunOverrides {
    fn apply(self, config: &mut BridgeConfig) {
        if let Some(host) = self.host {
            config.source.host = host;
        }
        if let Some(port) = self.port {
            config.source.port = port;
        }
        if let Some(batch_size) = self.batch_size {
            config.streaming.batch_size = batch_size;
        }
        if self.metrics_port.is_some() {
            config.metrics.port = self.metrics_port;
        }
    }
}

// Note: no #[tracing::instrument] here; every log line for the life of the
// process would carry the span.
pub async fn handle_run(
    mut config: BridgeConfig,
    config_path: Option<PathBuf>,
    overrides: RunOverrides,
    dry_run: bool,
) -> Result<()> {
    overrides.apply(&mut config);

    info!("adsb-bridge {} starting", adsb_bridge::VERSION);
    match &config_path {
        Some(path) => info!("Using config {:?}", path),
        None => info!("No config file found, using built-in defaults"),
    }
    if dry_run {
        info!("Dry run: batches will be logged, not written");
    }

    let sink = config.build_sink(dry_run)?;
    let pipeline = Arc::new(
        Pipeline::new(config.pipeline_settings(), config.source_config(), sink)
            .context("Invalid pipeline configuration")?,
    );

    let cancel = CancellationToken::new();
    let metrics_task = config.metrics.port.map(|port| {
        let handle = init_metrics();
        initialize_bridge_metrics();
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, handle, pipeline, cancel).await {
                error!("Metrics server stopped: {:#}", e);
            }
        })
    });

    pipeline.start().await;

    let interval_seconds = config.metrics.status_interval_seconds.max(1);
    let mut status_interval = tokio::time::interval(Duration::from_secs(interval_seconds));
    status_interval.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let signal = loop {
        tokio::select! {
            signal = &mut shutdown => break signal?,
            _ = status_interval.tick() => log_status(&pipeline).await,
        }
    };

    info!("Received {}, shutting down...", signal);
    if let Some(summary) = pipeline.stop().await {
        info!(
            "Final summary: {}",
            serde_json::to_string(&summary).unwrap_or_default()
        );
    }

    cancel.cancel();
    if let Some(task) = metrics_task {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
    Ok(())
}

async fn log_status(pipeline: &Pipeline) {
    let status = pipeline.status().await;
    info!(
        "Status: {} processed, {} delivered, {} retried batches, {} rejected, {} dropped, queue depth {}, {:.1} msg/s, source {}",
        status.counters.records_enqueued,
        status.counters.records_delivered,
        status.counters.batches_failed,
        status.counters.lines_rejected,
        status.counters.records_dropped,
        status.queue_depth,
        status.throughput,
        status.source.state
    );
}

/// Resolve on SIGINT or SIGTERM, naming the one that arrived
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}
