use chrono::Utc;

/// Current unix time in milliseconds. Event timestamps and relationship
/// created_at/completed_at columns use this resolution.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as RFC 3339, for created_at/updated_at audit
/// columns.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
