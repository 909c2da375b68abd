//! Wall-clock helpers.

use chrono::Utc;

/// Current Unix time in milliseconds, as stamped on every envelope.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
