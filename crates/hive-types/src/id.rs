// Identifier and timestamp helpers shared across the workspace.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Mint a fresh 36-character identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp the way it is persisted: RFC 3339, UTC, millisecond precision.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
