use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{MessageKind, SurveillanceRecord};

/// Family tag every accepted SBS line starts with
pub const MESSAGE_FAMILY_TAG: &str = "MSG";

/// Fields in a complete SBS `MSG` line (positions 0 through 21)
pub const MIN_FIELDS: usize = 22;

/// Why a line did not produce a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("SBS line too short: expected at least {MIN_FIELDS} fields, got {found}")]
    TooFewFields { found: usize },
    #[error("SBS line does not start with {MESSAGE_FAMILY_TAG}")]
    UnknownFamily,
}

impl Rejection {
    /// Metric label for this rejection
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::TooFewFields { .. } => "too_few_fields",
            Rejection::UnknownFamily => "unknown_family",
        }
    }
}

/// Parse an SBS CSV line, stamping it with the current time
///
/// SBS format: MSG,<type>,<session_id>,<aircraft_db_id>,<hex_ident>,<flight_id>,
///             <date_gen>,<time_gen>,<date_log>,<time_log>,<callsign>,<altitude>,
///             <ground_speed>,<track>,<latitude>,<longitude>,<vertical_rate>,<squawk>,
///             <alert>,<emergency>,<spi>,<on_ground>
pub fn parse_sbs_line(line: &str) -> Result<SurveillanceRecord, Rejection> {
    parse_sbs_line_at(line, Utc::now())
}

/// Parse an SBS CSV line with an explicit receive time
///
/// Every scalar field is converted on its own; a field that is empty or
/// malformed becomes `None` (or `false` for flags) and the rest of the line is
/// still used.
pub fn parse_sbs_line_at(
    line: &str,
    received_at: DateTime<Utc>,
) -> Result<SurveillanceRecord, Rejection> {
    let fields: Vec<&str> = line.trim().split(',').collect();

    if fields.len() < MIN_FIELDS {
        return Err(Rejection::TooFewFields {
            found: fields.len(),
        });
    }

    if fields[0] != MESSAGE_FAMILY_TAG {
        return Err(Rejection::UnknownFamily);
    }

    Ok(SurveillanceRecord {
        insert_id: Uuid::now_v7(),
        message_kind: MessageKind::from_field(fields[1]),
        session_id: parse_optional_string(fields[2]),
        aircraft_db_id: parse_optional_string(fields[3]),
        aircraft_id: parse_optional_string(fields[4]),
        flight_id: parse_optional_string(fields[5]),
        date_generated: join_date_time(fields[6], fields[7]),
        date_logged: join_date_time(fields[8], fields[9]),
        callsign: parse_optional_string(fields[10]),
        altitude: parse_optional_number(fields[11]),
        ground_speed: parse_optional_number(fields[12]),
        track: parse_optional_number(fields[13]),
        latitude: parse_optional_number(fields[14]),
        longitude: parse_optional_number(fields[15]),
        vertical_rate: parse_optional_number(fields[16]),
        transponder_code: parse_optional_string(fields[17]),
        alert: parse_flag(fields[18]),
        emergency: parse_flag(fields[19]),
        special_position: parse_flag(fields[20]),
        on_ground: parse_flag(fields[21]),
        received_at,
    })
}

/// Render the positional layout of a line, one `[idx] 'value'` per field
pub fn describe_fields(line: &str) -> String {
    let fields: Vec<&str> = line.trim().split(',').collect();
    let mut out = format!("SBS message ({} fields):\n", fields.len());
    for (i, field) in fields.iter().enumerate() {
        out.push_str(&format!("  [{i:2}] '{field}'\n"));
    }
    out
}

fn parse_optional_string(field: &str) -> Option<String> {
    let field = field.trim();
    (!field.is_empty()).then(|| field.to_string())
}

fn parse_optional_number<T: std::str::FromStr>(field: &str) -> Option<T> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    field.parse().ok()
}

fn parse_flag(field: &str) -> bool {
    field.trim() == "1"
}

fn join_date_time(date: &str, time: &str) -> Option<String> {
    let (date, time) = (date.trim(), time.trim());
    if date.is_empty() || time.is_empty() {
        return None;
    }
    Some(format!("{date} {time}"))
}
