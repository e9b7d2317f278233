use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SBS transmission types (MSG,1 through MSG,8)
///
/// Anything outside 1-8 is kept verbatim in `Other` so a record is never lost
/// because a feeder emits a type we don't know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageKind {
    /// MSG,1: ES Identification and Category (callsign)
    EsIdentification,
    /// MSG,2: ES Surface Position Message
    EsSurfacePosition,
    /// MSG,3: ES Airborne Position Message (altitude, lat/lon)
    EsAirbornePosition,
    /// MSG,4: ES Airborne Velocity Message (speed, track, vertical rate)
    EsAirborneVelocity,
    /// MSG,5: Surveillance Alt Message
    SurveillanceAlt,
    /// MSG,6: Surveillance ID Message (squawk)
    SurveillanceId,
    /// MSG,7: Air To Air Message
    AirToAir,
    /// MSG,8: All Call Reply
    AllCallReply,
    /// Unrecognized transmission type, raw field text
    Other(String),
}

impl MessageKind {
    /// Classify the transmission-type field of an SBS line
    pub fn from_field(field: &str) -> Self {
        match field.trim() {
            "1" => Self::EsIdentification,
            "2" => Self::EsSurfacePosition,
            "3" => Self::EsAirbornePosition,
            "4" => Self::EsAirborneVelocity,
            "5" => Self::SurveillanceAlt,
            "6" => Self::SurveillanceId,
            "7" => Self::AirToAir,
            "8" => Self::AllCallReply,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire representation, as it appears in the SBS line
    pub fn as_str(&self) -> &str {
        match self {
            Self::EsIdentification => "1",
            Self::EsSurfacePosition => "2",
            Self::EsAirbornePosition => "3",
            Self::EsAirborneVelocity => "4",
            Self::SurveillanceAlt => "5",
            Self::SurveillanceId => "6",
            Self::AirToAir => "7",
            Self::AllCallReply => "8",
            Self::Other(raw) => raw,
        }
    }

    /// Metric label for this kind
    pub fn label(&self) -> &'static str {
        match self {
            Self::EsIdentification => "identification",
            Self::EsSurfacePosition => "surface_position",
            Self::EsAirbornePosition => "airborne_position",
            Self::EsAirborneVelocity => "airborne_velocity",
            Self::SurveillanceAlt => "surveillance_alt",
            Self::SurveillanceId => "surveillance_id",
            Self::AirToAir => "air_to_air",
            Self::AllCallReply => "all_call_reply",
            Self::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG,{}", self.as_str())
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        Self::from_field(&value)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One parsed SBS line, ready for the sink
///
/// Created once by the parser and never mutated afterwards. A record that
/// fails delivery is re-queued as-is, so `insert_id` stays stable across
/// retries and the sink can use it to drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveillanceRecord {
    /// Row de-duplication key, assigned at parse time
    #[serde(skip)]
    pub insert_id: Uuid,
    pub message_kind: MessageKind,
    pub session_id: Option<String>,
    /// Receiver-side aircraft database id (field 3)
    pub aircraft_db_id: Option<String>,
    /// ICAO hex address (field 4)
    pub aircraft_id: Option<String>,
    pub flight_id: Option<String>,
    pub callsign: Option<String>,
    /// Feet
    pub altitude: Option<i32>,
    /// Knots
    pub ground_speed: Option<f64>,
    /// Degrees
    pub track: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Feet per minute
    pub vertical_rate: Option<i32>,
    /// Squawk
    pub transponder_code: Option<String>,
    pub alert: bool,
    pub emergency: bool,
    /// SPI / ident flag
    pub special_position: bool,
    pub on_ground: bool,
    pub received_at: DateTime<Utc>,
    /// Source "generated" date and time, verbatim
    pub date_generated: Option<String>,
    /// Source "logged" date and time, verbatim
    pub date_logged: Option<String>,
}

impl SurveillanceRecord {
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// ICAO address as a number, when the hex ident is valid
    pub fn icao_address(&self) -> Option<u32> {
        self.aircraft_id
            .as_deref()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_round_trips_through_wire_text() {
        assert_eq!(MessageKind::from_field("3"), MessageKind::EsAirbornePosition);
        assert_eq!(MessageKind::from_field(" 8 "), MessageKind::AllCallReply);
        assert_eq!(
            MessageKind::from_field("9"),
            MessageKind::Other("9".to_string())
        );
        assert_eq!(MessageKind::from_field("").as_str(), "");
        assert_eq!(MessageKind::SurveillanceId.to_string(), "MSG,6");
    }

    #[test]
    fn test_message_kind_serializes_as_raw_type() {
        let json = serde_json::to_string(&MessageKind::EsAirborneVelocity).unwrap();
        assert_eq!(json, "\"4\"");

        let kind: MessageKind = serde_json::from_str("\"12\"").unwrap();
        assert_eq!(kind, MessageKind::Other("12".to_string()));
        assert_eq!(kind.label(), "other");
    }
}
