use chrono::{DateTime, Utc};

/// Milliseconds since the Unix epoch. Single seam for all expiry/backoff math.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
