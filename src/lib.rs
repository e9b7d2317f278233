//! ADS-B bridge: streams SBS-1 BaseStation messages from a TCP feed into an
//! analytical store in batches, with at-least-once delivery.

pub mod config;
pub mod dispatcher;
pub mod ingest_queue;
pub mod log_format;
pub mod metrics;
pub mod pipeline;
pub mod pipeline_stats;
pub mod queue_config;
pub mod sbs;
pub mod sink;

pub use config::BridgeConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use ingest_queue::{BackpressurePolicy, IngestQueue};
pub use pipeline::{Pipeline, PipelineSettings, PipelineStatus, RunSummary};
pub use pipeline_stats::{CounterSnapshot, PipelineCounters};
pub use sbs::{SourceConfig, SurveillanceRecord, parse_sbs_line};
pub use sink::{RecordSink, SinkError};

/// `git describe` output when built from a checkout, else the package version
pub const VERSION: &str = match option_env!("VERGEN_GIT_DESCRIBE") {
    Some(describe) => describe,
    None => env!("CARGO_PKG_VERSION"),
};
