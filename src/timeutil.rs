//! Timezone helpers.
//!
//! Users carry an IANA timezone name; "today" for stats and calorie
//! summaries means the user's local calendar day, converted to a UTC window
//! for range scans.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Parse an IANA timezone name, falling back to UTC on anything unknown.
pub fn safe_tz(name: &str) -> Tz {
    name.parse().unwrap_or(Tz::UTC)
}

/// The UTC window covering the local calendar day containing `now`.
///
/// Returns `[start, end)`.
pub fn local_day_bounds(tz: Tz, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = now.with_timezone(&tz).date_naive();
    let start_local = local_date.and_hms_opt(0, 0, 0).expect("midnight exists");
    let end_local = start_local + Duration::days(1);
    (local_to_utc(tz, start_local), local_to_utc(tz, end_local))
}

/// Resolve a naive local timestamp to UTC, taking the earlier candidate on
/// DST ambiguity and skipping forward across gaps.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => {
            // Inside a spring-forward gap; nudge past it.
            let shifted = local + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&local))
        }
    }
}

/// Parse an ISO-8601-ish local timestamp produced by the extraction model.
///
/// Accepts `YYYY-MM-DDTHH:MM:SS`, the space-separated variant, and values
/// with an explicit offset or trailing `Z` (taken at face value).
pub fn parse_local_datetime(value: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(local_to_utc(tz, naive));
        }
    }
    None
}

/// Format a UTC instant as a short local clock time, e.g. "2:30 PM".
pub fn short_local_time(at: DateTime<Utc>, tz: Tz) -> String {
    let local = at.with_timezone(&tz);
    let formatted = local.format("%I:%M %p").to_string();
    // %I zero-pads the hour; the replies read better without it.
    formatted.trim_start_matches('0').to_string()
}
