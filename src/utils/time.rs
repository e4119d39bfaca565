//! Time and timestamp utilities

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::{json, Value};

/// Get current time information as JSON
pub fn get_current_time() -> Value {
    describe_time(Utc::now())
}

/// Describe an instant in the shape returned by the `get_current_time` tool
pub fn describe_time(now: DateTime<Utc>) -> Value {
    json!({
        "timestamp": now.timestamp(),
        "timestamp_ms": now.timestamp_millis(),
        "iso8601": now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "readable": now.format("%A, %-d %B %Y %H:%M:%S UTC").to_string(),
        "components": {
            "year": now.year(),
            "month": now.month(),
            "day": now.day(),
            "hour": now.hour(),
            "minute": now.minute(),
            "second": now.second(),
            "weekday": now.format("%A").to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_describe_time() {
        let t = Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap();
        let v = describe_time(t);
        assert_eq!(v["iso8601"], "2024-02-29T13:05:09Z");
        assert_eq!(v["readable"], "Thursday, 29 February 2024 13:05:09 UTC");
        assert_eq!(v["components"]["month"], 2);
        assert_eq!(v["components"]["weekday"], "Thursday");
    }
}
