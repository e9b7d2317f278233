use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::framing::LineFramer;
use super::parser::{MESSAGE_FAMILY_TAG, parse_sbs_line};
use crate::ingest_queue::IngestQueue;
use crate::pipeline_stats::PipelineCounters;

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// How often the connected loop logs its message rate
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Result of one connect-and-read cycle
enum ConnectionResult {
    /// Stop was requested; do not reconnect
    Cancelled,
    /// Connection could not be established
    ConnectionFailed(anyhow::Error),
    /// Connection was established but then failed or closed
    OperationFailed(anyhow::Error),
}

/// Where the SBS feed lives and how patiently to talk to it
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// SBS server hostname
    pub host: String,
    /// SBS server port (typically 30003)
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound on a single read; keeps the loop responsive to stop
    pub read_timeout: Duration,
    /// No bytes at all for this long and the connection is considered dead
    pub idle_timeout: Duration,
    /// Initial delay between reconnection attempts (doubles on each failure)
    pub retry_delay: Duration,
    /// Cap for the exponential backoff
    pub max_retry_delay: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 30003,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl SourceConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Next backoff delay after waiting `current`
    fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(current.saturating_mul(2), self.max_retry_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Connection health, shared with status and health-check callers
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub state: ConnectionState,
    pub endpoint: String,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_data_at: Option<DateTime<Utc>>,
    /// Times the connector went back to connecting after a lost or failed connection
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl SourceHealth {
    fn new(endpoint: String) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint,
            connected_since: None,
            last_data_at: None,
            reconnects: 0,
            last_error: None,
        }
    }
}

/// Keeps a TCP connection to an SBS-1 BaseStation feed alive and turns what
/// it sends into records on the ingest queue.
pub struct SourceConnector {
    config: SourceConfig,
    health: Arc<RwLock<SourceHealth>>,
}

impl SourceConnector {
    pub fn new(config: SourceConfig) -> Self {
        let health = Arc::new(RwLock::new(SourceHealth::new(config.endpoint())));
        Self { config, health }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn health(&self) -> Arc<RwLock<SourceHealth>> {
        self.health.clone()
    }

    /// Connect, read, reconnect; forever until `cancel` fires.
    #[tracing::instrument(skip_all, fields(endpoint = %self.config.endpoint()))]
    pub async fn run(
        &self,
        queue: IngestQueue,
        counters: Arc<PipelineCounters>,
        cancel: CancellationToken,
    ) {
        let mut framer = LineFramer::new();
        let mut current_delay = self.config.retry_delay;
        let mut attempt = 0u32;

        loop {
            let result = self
                .connect_and_process(&queue, &counters, &mut framer, &cancel)
                .await;

            // A partial line from a dead connection can't be completed by the next one
            framer.reset();
            self.mark_disconnected(None).await;

            let delay = match result {
                ConnectionResult::Cancelled => break,
                ConnectionResult::ConnectionFailed(e) => {
                    attempt += 1;
                    metrics::counter!("sbs.connection.failed_total").increment(1);
                    warn!(
                        "Failed to connect to SBS server {} (attempt {}): {} - retrying in {:.1}s",
                        self.config.endpoint(),
                        attempt,
                        e,
                        current_delay.as_secs_f64()
                    );
                    self.mark_disconnected(Some(e.to_string())).await;
                    let delay = current_delay;
                    current_delay = self.config.next_delay(current_delay);
                    delay
                }
                ConnectionResult::OperationFailed(e) => {
                    metrics::counter!("sbs.connection.operation_failed_total").increment(1);
                    // The connection worked, so start the backoff over
                    attempt = 0;
                    current_delay = self.config.retry_delay;
                    warn!(
                        "SBS connection to {} lost: {} - reconnecting in {:.1}s",
                        self.config.endpoint(),
                        e,
                        current_delay.as_secs_f64()
                    );
                    self.mark_disconnected(Some(e.to_string())).await;
                    let delay = current_delay;
                    current_delay = self.config.next_delay(current_delay);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.health.write().await.reconnects += 1;
            metrics::counter!("sbs.connection.reconnects_total").increment(1);
        }

        info!("SBS source connector stopped");
    }

    async fn connect_and_process(
        &self,
        queue: &IngestQueue,
        counters: &PipelineCounters,
        framer: &mut LineFramer,
        cancel: &CancellationToken,
    ) -> ConnectionResult {
        let address = self.config.endpoint();
        self.health.write().await.state = ConnectionState::Connecting;
        info!("Connecting to SBS server at {}", address);

        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address));
        let stream = tokio::select! {
            _ = cancel.cancelled() => return ConnectionResult::Cancelled,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return ConnectionResult::ConnectionFailed(anyhow::anyhow!("connect failed: {}", e));
                }
                Err(_) => {
                    return ConnectionResult::ConnectionFailed(anyhow::anyhow!(
                        "connect timed out after {:.1}s",
                        self.config.connect_timeout.as_secs_f64()
                    ));
                }
            },
        };

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| address.clone());
        info!("Connected to SBS server at {}", peer);
        metrics::gauge!("sbs.connection.connected").set(1.0);
        {
            let mut health = self.health.write().await;
            health.state = ConnectionState::Connected;
            health.connected_since = Some(Utc::now());
            health.last_error = None;
        }

        self.process_connection(stream, &peer, queue, counters, framer, cancel)
            .await
    }

    async fn process_connection(
        &self,
        mut stream: TcpStream,
        peer: &str,
        queue: &IngestQueue,
        counters: &PipelineCounters,
        framer: &mut LineFramer,
        cancel: &CancellationToken,
    ) -> ConnectionResult {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let connection_start = Instant::now();
        let mut last_data = Instant::now();
        let mut message_count = 0u64;
        let mut window_count = 0u64;
        let mut last_stats_log = Instant::now();

        loop {
            if cancel.is_cancelled() {
                info!(
                    "Stop requested, closing SBS connection to {} after {:.1}s, received {} messages",
                    peer,
                    connection_start.elapsed().as_secs_f64(),
                    message_count
                );
                return ConnectionResult::Cancelled;
            }

            match tokio::time::timeout(self.config.read_timeout, stream.read(&mut buf)).await {
                Err(_) => {
                    // Nothing this tick; that's normal unless it's been quiet far too long
                    if last_data.elapsed() >= self.config.idle_timeout {
                        return ConnectionResult::OperationFailed(anyhow::anyhow!(
                            "no data for {:.1}s",
                            self.config.idle_timeout.as_secs_f64()
                        ));
                    }
                }
                Ok(Ok(0)) => {
                    info!(
                        "SBS connection closed by server ({}) after {:.1}s, received {} messages, {} bytes discarded",
                        peer,
                        connection_start.elapsed().as_secs_f64(),
                        message_count,
                        framer.discarded_bytes()
                    );
                    return ConnectionResult::OperationFailed(anyhow::anyhow!(
                        "connection closed by server"
                    ));
                }
                Ok(Ok(n)) => {
                    last_data = Instant::now();
                    metrics::counter!("sbs.bytes.received_total").increment(n as u64);
                    self.health.write().await.last_data_at = Some(Utc::now());

                    for line in framer.push(&buf[..n]) {
                        if !self.handle_line(&line, queue, counters, cancel).await {
                            return ConnectionResult::Cancelled;
                        }
                        message_count += 1;
                        window_count += 1;
                    }

                    if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
                        let rate = window_count as f64 / last_stats_log.elapsed().as_secs_f64();
                        info!(
                            "SBS stats: {:.1} msg/s, {} total messages, {} bytes of unterminated lines discarded",
                            rate,
                            message_count,
                            framer.discarded_bytes()
                        );
                        metrics::gauge!("sbs.message_rate").set(rate);
                        window_count = 0;
                        last_stats_log = Instant::now();
                    }
                }
                Ok(Err(e)) => {
                    error!(
                        "SBS read error from {} after {:.1}s: {}",
                        peer,
                        connection_start.elapsed().as_secs_f64(),
                        e
                    );
                    return ConnectionResult::OperationFailed(anyhow::anyhow!("read error: {}", e));
                }
            }
        }
    }

    /// Filter, parse and enqueue one line. Returns `false` if stop was
    /// requested while waiting for queue space.
    async fn handle_line(
        &self,
        line: &str,
        queue: &IngestQueue,
        counters: &PipelineCounters,
        cancel: &CancellationToken,
    ) -> bool {
        PipelineCounters::add(&counters.lines_received, 1);
        metrics::counter!("sbs.lines.received_total").increment(1);

        if !line.trim_start().starts_with(MESSAGE_FAMILY_TAG) {
            trace!("Skipping non-MSG line: {}", line);
            metrics::counter!("sbs.lines.filtered_total").increment(1);
            return true;
        }

        let record = match parse_sbs_line(line) {
            Ok(record) => record,
            Err(rejection) => {
                PipelineCounters::add(&counters.lines_rejected, 1);
                metrics::counter!("sbs.lines.rejected_total", "reason" => rejection.label())
                    .increment(1);
                debug!("Rejected SBS line ({}): {}", rejection, line);
                return true;
            }
        };

        metrics::counter!("sbs.records.parsed_total", "kind" => record.message_kind.label())
            .increment(1);

        let accepted = tokio::select! {
            biased;
            accepted = queue.enqueue(record) => accepted,
            _ = cancel.cancelled() => {
                debug!("Stop requested while waiting for queue space");
                return false;
            }
        };

        if accepted {
            PipelineCounters::add(&counters.records_enqueued, 1);
        } else {
            PipelineCounters::add(&counters.records_dropped, 1);
        }
        true
    }

    async fn mark_disconnected(&self, error: Option<String>) {
        metrics::gauge!("sbs.connection.connected").set(0.0);
        let mut health = self.health.write().await;
        health.state = ConnectionState::Disconnected;
        health.connected_since = None;
        if error.is_some() {
            health.last_error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const LINE: &str = "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,UAL1,35000,450,90,40.0,-74.0,0,1200,0,0,0,0";

    fn config_for(port: u16) -> SourceConfig {
        SourceConfig {
            host: "127.0.0.1".to_string(),
            port,
            retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(200),
            ..SourceConfig::default()
        }
    }

    async fn wait_for_size(queue: &IngestQueue, size: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.size() < size {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("records should arrive");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SourceConfig::default();
        let mut delay = config.retry_delay;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_secs());
            delay = config.next_delay(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn test_reads_filters_and_parses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = SourceConnector::new(config_for(port));
        let queue = IngestQueue::unbounded();
        let counters = Arc::new(PipelineCounters::default());
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let payload = format!("STA,,5,179,400AE7,10103\nMSG,3,too,short\n{LINE}\r\n");
            socket.write_all(payload.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let health = connector.health();
        let task = {
            let queue = queue.clone();
            let counters = counters.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run(queue, counters, cancel).await })
        };

        wait_for_size(&queue, 1).await;
        assert_eq!(health.read().await.state, ConnectionState::Connected);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connector should stop promptly")
            .unwrap();
        server.abort();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.lines_received, 3);
        assert_eq!(snapshot.lines_rejected, 1);
        assert_eq!(snapshot.records_enqueued, 1);

        let batch = queue.dequeue_batch(10, Duration::from_millis(10)).await;
        assert_eq!(batch[0].aircraft_id.as_deref(), Some("ABC123"));
        assert_eq!(health.read().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = SourceConnector::new(config_for(port));
        let health = connector.health();
        let queue = IngestQueue::unbounded();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                socket.write_all(format!("{LINE}\n").as_bytes()).await.unwrap();
                // Dropping the socket closes the connection
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                connector
                    .run(queue, Arc::new(PipelineCounters::default()), cancel)
                    .await
            })
        };

        wait_for_size(&queue, 2).await;
        assert!(health.read().await.reconnects >= 1);

        cancel.cancel();
        task.await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_source_keeps_retrying_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = SourceConnector::new(config_for(port));
        let health = connector.health();
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                connector
                    .run(
                        IngestQueue::unbounded(),
                        Arc::new(PipelineCounters::default()),
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        {
            let health = health.read().await;
            assert!(health.reconnects >= 2, "reconnects: {}", health.reconnects);
            assert!(health.last_error.is_some());
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connector should stop during backoff")
            .unwrap();
    }

    #[tokio::test]
    async fn test_leading_whitespace_lines_are_parsed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = SourceConnector::new(config_for(port));
        let queue = IngestQueue::unbounded();
        let counters = Arc::new(PipelineCounters::default());
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let payload = format!("  {LINE}\n\t{LINE}\r\n");
            socket.write_all(payload.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let task = {
            let queue = queue.clone();
            let counters = counters.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { connector.run(queue, counters, cancel).await })
        };

        wait_for_size(&queue, 2).await;
        cancel.cancel();
        task.await.unwrap();
        server.abort();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.lines_received, 2);
        assert_eq!(snapshot.lines_rejected, 0);
        assert_eq!(snapshot.records_enqueued, 2);
    }

    #[tokio::test]
    async fn test_silent_server_triggers_idle_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let server = {
            let accepted = accepted.clone();
            tokio::spawn(async move {
                // Hold every socket open without writing to it
                let mut sockets = Vec::new();
                loop {
                    let (socket, _) = listener.accept().await.unwrap();
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    sockets.push(socket);
                }
            })
        };

        let connector = SourceConnector::new(SourceConfig {
            idle_timeout: Duration::from_millis(300),
            ..config_for(port)
        });
        let health = connector.health();
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                connector
                    .run(
                        IngestQueue::unbounded(),
                        Arc::new(PipelineCounters::default()),
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(std::sync::atomic::Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connector should reconnect after going idle");

        {
            let health = health.read().await;
            assert!(health.reconnects >= 1, "reconnects: {}", health.reconnects);
            assert!(matches!(
                health.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ));
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connector should stop promptly")
            .unwrap();
        server.abort();
    }
}
