use std::collections::HashSet;
use tracing::info;

use super::{RecordSink, SinkError};
use crate::sbs::SurveillanceRecord;

/// Accepts every batch and only logs it. Used for `run --dry-run`.
#[derive(Debug, Default)]
pub struct LogSink;

/// Aircraft in the batch, keyed by ICAO address. Rows with a malformed hex
/// ident are not counted.
fn distinct_aircraft(rows: &[SurveillanceRecord]) -> usize {
    rows.iter()
        .filter_map(SurveillanceRecord::icao_address)
        .collect::<HashSet<_>>()
        .len()
}

#[async_trait::async_trait]
impl RecordSink for LogSink {
    fn destination(&self) -> String {
        "log".to_string()
    }

    async fn insert_rows(&self, rows: &[SurveillanceRecord]) -> Result<(), SinkError> {
        let with_position = rows.iter().filter(|r| r.has_position()).count();
        info!(
            rows = rows.len(),
            aircraft = distinct_aircraft(rows),
            with_position,
            first_aircraft = ?rows.first().and_then(|r| r.aircraft_id.as_deref()),
            "Dry run: discarding batch"
        );
        Ok(())
    }
}
