use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::ingest_queue::BackpressurePolicy;
use crate::pipeline::PipelineSettings;
use crate::queue_config::{
    DEFAULT_BATCH_MAX_WAIT, DEFAULT_BATCH_SIZE, DEFAULT_FAILURE_BACKOFF, DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::sbs::SourceConfig;
use crate::sink::bigquery::DEFAULT_ENDPOINT;
use crate::sink::{BigQuerySink, BigQuerySinkConfig, LogSink, RecordSink};

/// Env var holding the config file path
pub const CONFIG_PATH_ENV: &str = "ADSB_BRIDGE_CONFIG";

/// Env var holding the sink bearer token when the file doesn't
pub const SINK_TOKEN_ENV: &str = "ADSB_BRIDGE_SINK_TOKEN";

const DEFAULT_CONFIG_FILE: &str = "./bridge.toml";

/// Top-level bridge configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub source: SourceSection,
    pub queue: QueueSection,
    pub streaming: StreamingSection,
    pub sink: SinkSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    pub host: String,
    pub port: u16,
    pub read_timeout_ms: u64,
    pub connect_timeout_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 30003,
            read_timeout_ms: 100,
            connect_timeout_seconds: 5,
            retry_delay_seconds: 1,
            max_retry_delay_seconds: 60,
            idle_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Unset means unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    pub backpressure: BackpressurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub failure_backoff_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait_ms: DEFAULT_BATCH_MAX_WAIT.as_millis() as u64,
            failure_backoff_ms: DEFAULT_FAILURE_BACKOFF.as_millis() as u64,
            shutdown_timeout_seconds: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Bigquery,
    /// Log batches instead of writing them anywhere
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub kind: SinkKind,
    pub endpoint: String,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project_id: String::new(),
            dataset_id: "SBS_Data".to_string(),
            table_id: "RealTimeStream".to_string(),
            access_token: None,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Unset disables the metrics/status server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status_interval_seconds: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            port: None,
            status_interval_seconds: 10,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: BridgeConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load from the resolved path. Only the implicit default file may be
    /// missing, in which case the built-in defaults apply.
    pub fn load_resolved(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let (path, required) = config_path(explicit);
        if !required && !path.exists() {
            return Ok((Self::default(), None));
        }
        Ok((Self::load(&path)?, Some(path)))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    /// Copy safe to print: the access token is masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.sink.access_token.is_some() {
            config.sink.access_token = Some("********".to_string());
        }
        config
    }

    pub fn source_config(&self) -> SourceConfig {
        let s = &self.source;
        SourceConfig {
            host: s.host.clone(),
            port: s.port,
            connect_timeout: Duration::from_secs(s.connect_timeout_seconds),
            read_timeout: Duration::from_millis(s.read_timeout_ms),
            idle_timeout: Duration::from_secs(s.idle_timeout_seconds),
            retry_delay: Duration::from_secs(s.retry_delay_seconds),
            max_retry_delay: Duration::from_secs(s.max_retry_delay_seconds),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let s = &self.streaming;
        PipelineSettings {
            queue_capacity: self.queue.capacity,
            backpressure: self.queue.backpressure,
            dispatcher: DispatcherConfig {
                batch_size: s.batch_size,
                max_wait: Duration::from_millis(s.max_wait_ms),
                failure_backoff: Duration::from_millis(s.failure_backoff_ms),
            },
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_seconds),
        }
    }

    /// Build the configured sink; `dry_run` forces the log sink
    pub fn build_sink(&self, dry_run: bool) -> Result<Arc<dyn RecordSink>> {
        if dry_run || self.sink.kind == SinkKind::Log {
            return Ok(Arc::new(LogSink));
        }

        let s = &self.sink;
        for (name, value) in [
            ("project_id", &s.project_id),
            ("dataset_id", &s.dataset_id),
            ("table_id", &s.table_id),
            ("endpoint", &s.endpoint),
        ] {
            if value.trim().is_empty() {
                bail!("[sink] {} must be set for the bigquery sink", name);
            }
        }

        let access_token = s
            .access_token
            .clone()
            .or_else(|| std::env::var(SINK_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty());

        let sink = BigQuerySink::new(BigQuerySinkConfig {
            endpoint: s.endpoint.clone(),
            project_id: s.project_id.clone(),
            dataset_id: s.dataset_id.clone(),
            table_id: s.table_id.clone(),
            access_token,
            request_timeout: Duration::from_secs(s.request_timeout_seconds),
        })
        .context("Failed to build BigQuery client")?;
        Ok(Arc::new(sink))
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `--config` flag
/// 2. `ADSB_BRIDGE_CONFIG` env var
/// 3. `./bridge.toml`
///
/// The flag reports whether the file must exist.
pub fn config_path(explicit: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = explicit {
        return (path.to_path_buf(), true);
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return (PathBuf::from(path), true);
    }
    (PathBuf::from(DEFAULT_CONFIG_FILE), false)
}
