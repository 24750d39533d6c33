//! Rendering of usage reset timestamps.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use tracing::debug;

/// Pacific standard time. DST is ignored.
const PACIFIC_OFFSET_SECS: i32 = 8 * 3600;

/// Render an ISO 8601 timestamp as e.g. `Thu Jan 15, 10:30AM PT`.
///
/// Empty input gives an empty string; anything unparseable is returned as is.
/// Timestamps without an offset are taken as UTC.
pub fn format_reset_time(iso: &str) -> String {
    let iso = iso.trim();
    if iso.is_empty() {
        return String::new();
    }
    let Some(pacific) = FixedOffset::west_opt(PACIFIC_OFFSET_SECS) else {
        return iso.to_string();
    };

    let parsed = DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.with_timezone(&pacific))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc().with_timezone(&pacific))
        });

    match parsed {
        Ok(dt) => dt.format("%a %b %d, %I:%M%p PT").to_string(),
        Err(e) => {
            debug!(value = iso, error = %e, "Unparseable reset time");
            iso.to_string()
        }
    }
}
