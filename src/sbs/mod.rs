pub mod client;
pub mod framing;
pub mod parser;
pub mod record;

pub use client::{ConnectionState, SourceConfig, SourceConnector, SourceHealth};
pub use framing::LineFramer;
pub use parser::{
    MESSAGE_FAMILY_TAG, MIN_FIELDS, Rejection, describe_fields, parse_sbs_line, parse_sbs_line_at,
};
pub use record::{MessageKind, SurveillanceRecord};
