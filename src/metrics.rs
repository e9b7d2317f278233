use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pipeline::Pipeline;

/// Initialize Prometheus metrics exporter
/// Returns a handle that can be used to render metrics for scraping
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        // Sink round-trips: 5ms up to the 30s request timeout
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("dispatcher.batch_duration_ms".to_string()),
            &[
                5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
                30000.0,
            ],
        )
        .expect("failed to set buckets for dispatcher.batch_duration_ms")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task(cancel: CancellationToken) {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb_str) = line.split_whitespace().nth(1)
                && let Ok(kb) = kb_str.parse::<f64>()
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

/// Initialize bridge metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_bridge_metrics() {
    // Source connection
    metrics::gauge!("sbs.connection.connected").set(0.0);
    metrics::counter!("sbs.connection.failed_total").absolute(0);
    metrics::counter!("sbs.connection.operation_failed_total").absolute(0);
    metrics::counter!("sbs.connection.reconnects_total").absolute(0);
    metrics::counter!("sbs.bytes.received_total").absolute(0);
    metrics::gauge!("sbs.message_rate").set(0.0);

    // Framing and parsing
    metrics::counter!("sbs.framing.oversized_discarded_total").absolute(0);
    metrics::counter!("sbs.lines.received_total").absolute(0);
    metrics::counter!("sbs.lines.filtered_total").absolute(0);

    // Queue
    metrics::gauge!("ingest_queue.depth").set(0.0);
    metrics::counter!("ingest_queue.dropped_total").absolute(0);
    metrics::counter!("ingest_queue.requeued_total").absolute(0);

    // Delivery
    metrics::counter!("dispatcher.records_delivered_total").absolute(0);
    metrics::counter!("dispatcher.batches_delivered_total").absolute(0);
    metrics::gauge!("pipeline.running").set(0.0);
}

#[derive(Clone)]
struct MetricsState {
    handle: PrometheusHandle,
    pipeline: Arc<Pipeline>,
}

async fn metrics_handler(State(state): State<MetricsState>) -> String {
    state.handle.render()
}

async fn status_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    Json(state.pipeline.status().await)
}

/// 200 while running with a live source connection, 503 otherwise
async fn health_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    if state.pipeline.is_healthy().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

pub fn router(handle: PrometheusHandle, pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsState { handle, pipeline })
}

/// Serve `/metrics`, `/status` and `/health` until `cancel` fires
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;

    info!("Starting metrics server on http://{}/metrics", addr);
    info!("Pipeline status available at http://{}/status", addr);

    tokio::spawn(process_metrics_task(cancel.clone()));

    axum::serve(listener, router(handle, pipeline))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Metrics server failed")
}
