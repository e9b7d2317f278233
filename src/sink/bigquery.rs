use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{RecordSink, RowError, SinkError};
use crate::sbs::SurveillanceRecord;

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Where and how to stream rows
#[derive(Debug, Clone)]
pub struct BigQuerySinkConfig {
    /// API root, e.g. `https://bigquery.googleapis.com/bigquery/v2`
    pub endpoint: String,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    /// Sent as `Authorization: Bearer ...` when present
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

/// Streaming-insert (`tabledata.insertAll`) client
///
/// Every row carries the record's `insert_id` so the warehouse can drop the
/// duplicates that at-least-once redelivery produces.
pub struct BigQuerySink {
    http: reqwest::Client,
    config: BigQuerySinkConfig,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertRow<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRow<'a> {
    insert_id: String,
    json: &'a SurveillanceRecord,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertError>,
}

#[derive(Debug, Deserialize)]
struct InsertError {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl BigQuerySink {
    pub fn new(config: BigQuerySinkConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("adsb-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            config.endpoint.trim_end_matches('/'),
            config.project_id,
            config.dataset_id,
            config.table_id
        );

        Ok(Self { http, config, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl RecordSink for BigQuerySink {
    fn destination(&self) -> String {
        format!(
            "{}.{}.{}",
            self.config.project_id, self.config.dataset_id, self.config.table_id
        )
    }

    async fn insert_rows(&self, rows: &[SurveillanceRecord]) -> Result<(), SinkError> {
        let body = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            rows: rows
                .iter()
                .map(|record| InsertRow {
                    insert_id: record.insert_id.to_string(),
                    json: record,
                })
                .collect(),
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        trace!("Posting {} rows to {}", rows.len(), self.url);
        let response = request.send().await.map_err(SinkError::transport)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        // An empty 200 body means every row was accepted
        let text = response.text().await.map_err(SinkError::transport)?;
        let parsed: InsertAllResponse = if text.trim().is_empty() {
            InsertAllResponse::default()
        } else {
            serde_json::from_str(&text).map_err(SinkError::transport)?
        };

        if parsed.insert_errors.is_empty() {
            debug!("Inserted {} rows into {}", rows.len(), self.destination());
            return Ok(());
        }

        let errors = parsed
            .insert_errors
            .into_iter()
            .map(|e| RowError {
                index: e.index,
                reason: e
                    .errors
                    .iter()
                    .map(|p| format!("{}: {}", p.reason, p.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            })
            .collect();
        Err(SinkError::Rejected(errors))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbs::parse_sbs_line;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeWarehouse {
        requests: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
        reply: Arc<Mutex<(u16, serde_json::Value)>>,
    }

    async fn insert_all(
        State(fake): State<FakeWarehouse>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        fake.requests.lock().unwrap().push((auth, body));
        let (status, reply) = fake.reply.lock().unwrap().clone();
        (StatusCode::from_u16(status).unwrap(), Json(reply))
    }

    async fn spawn_fake(status: u16, reply: serde_json::Value) -> (FakeWarehouse, String) {
        let fake = FakeWarehouse::default();
        *fake.reply.lock().unwrap() = (status, reply);

        let app = Router::new()
            .route(
                "/projects/{project}/datasets/{dataset}/tables/{table}/insertAll",
                post(insert_all),
            )
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (fake, format!("http://{addr}"))
    }

    fn sink(endpoint: String, token: Option<&str>) -> BigQuerySink {
        BigQuerySink::new(BigQuerySinkConfig {
            endpoint,
            project_id: "proj".to_string(),
            dataset_id: "SBS_Data".to_string(),
            table_id: "RealTimeStream".to_string(),
            access_token: token.map(str::to_string),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn rows() -> Vec<SurveillanceRecord> {
        [
            "MSG,3,1,1,ABC123,1,2024/01/01,00:00:00.000,2024/01/01,00:00:00.000,UAL1,35000,450,90,40.0,-74.0,0,1200,0,0,0,0",
            "MSG,1,1,1,DEF456,1,2024/01/01,00:00:01.000,2024/01/01,00:00:01.000,DAL2,,,,,,,,0,0,0,0",
        ]
        .iter()
        .map(|line| parse_sbs_line(line).unwrap())
        .collect()
    }

    #[test]
    fn test_url_and_destination() {
        let sink = sink("https://example.test/bigquery/v2/".to_string(), None);
        assert_eq!(
            sink.url(),
            "https://example.test/bigquery/v2/projects/proj/datasets/SBS_Data/tables/RealTimeStream/insertAll"
        );
        assert_eq!(sink.destination(), "proj.SBS_Data.RealTimeStream");
    }

    #[tokio::test]
    async fn test_successful_insert_sends_rows_with_insert_ids() {
        let (fake, endpoint) = spawn_fake(200, serde_json::json!({"kind": "bigquery#tableDataInsertAllResponse"})).await;
        let sink = sink(endpoint, Some("secret-token"));
        let rows = rows();

        sink.insert_rows(&rows).await.unwrap();

        let requests = fake.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (auth, body) = &requests[0];
        assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
        assert_eq!(body["skipInvalidRows"], false);
        let sent = body["rows"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["insertId"], rows[0].insert_id.to_string());
        assert_eq!(sent[0]["json"]["aircraft_id"], "ABC123");
        assert_eq!(sent[0]["json"]["message_kind"], "3");
        assert_eq!(sent[0]["json"]["altitude"], 35000);
        assert_eq!(sent[1]["json"]["callsign"], "DAL2");
        assert!(sent[1]["json"]["altitude"].is_null());
    }

    #[tokio::test]
    async fn test_insert_errors_become_rejection() {
        let reply = serde_json::json!({
            "insertErrors": [
                {"index": 1, "errors": [{"reason": "invalid", "message": "no such field: foo"}]}
            ]
        });
        let (_fake, endpoint) = spawn_fake(200, reply).await;
        let sink = sink(endpoint, None);

        match sink.insert_rows(&rows()).await {
            Err(SinkError::Rejected(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].index, 1);
                assert_eq!(errors[0].reason, "invalid: no such field: foo");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (_fake, endpoint) =
            spawn_fake(403, serde_json::json!({"error": {"message": "denied"}})).await;
        let sink = sink(endpoint, None);

        match sink.insert_rows(&rows()).await {
            Err(SinkError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert!(body.contains("denied"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = sink(format!("http://{addr}"), None);
        let err = sink.insert_rows(&rows()).await.unwrap_err();
        assert_eq!(err.label(), "transport");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
