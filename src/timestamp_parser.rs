use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};

/// Handles parsing timestamps from the formats session logs use
pub struct TimestampParser;

impl TimestampParser {
    /// Parse a timestamp string into a DateTime<Utc>.
    /// Accepts RFC 3339 (Z suffix or offset), naive ISO (assumed UTC) and
    /// Unix seconds.
    pub fn parse(timestamp_str: &str) -> Option<DateTime<Utc>> {
        let trimmed = timestamp_str.trim();
        if trimmed.is_empty() {
            return None;
        }

        let timestamp = if trimmed.ends_with('Z') {
            trimmed.replace('Z', "+00:00")
        } else {
            trimmed.to_string()
        };

        if let Ok(dt) = DateTime::parse_from_rfc3339(&timestamp) {
            return Some(dt.with_timezone(&Utc));
        }

        if let Ok(naive) = NaiveDateTime::parse_from_str(&timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }

        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(secs) = trimmed.parse::<i64>() {
                return Self::from_unix_seconds(secs as f64);
            }
        }

        None
    }

    pub fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        Utc.timestamp_opt(whole, nanos).single()
    }
}

/// Floor an instant to the start of its UTC hour.
pub fn floor_to_hour(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_z_suffix() {
        let result = TimestampParser::parse("2025-01-09T14:30:45.123Z").unwrap();
        assert_eq!(result.hour(), 14);
        assert_eq!(result.minute(), 30);
    }

    #[test]
    fn test_parse_offset_normalised_to_utc() {
        let result = TimestampParser::parse("2025-01-09T14:30:45+05:30").unwrap();
        assert_eq!(result.hour(), 9);
        assert_eq!(result.minute(), 0);
    }

    #[test]
    fn test_parse_naive() {
        assert!(TimestampParser::parse("2025-01-09T14:30:45.123").is_some());
    }

    #[test]
    fn test_parse_unix_seconds() {
        let result = TimestampParser::parse("1736433045").unwrap();
        assert_eq!(result, Utc.with_ymd_and_hms(2025, 1, 9, 14, 30, 45).unwrap());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(TimestampParser::parse("invalid").is_none());
        assert!(TimestampParser::parse("").is_none());
        assert!(TimestampParser::parse("2025-13-45T99:00:00Z").is_none());
    }

    #[test]
    fn test_floor_to_hour() {
        let ts = TimestampParser::parse("2025-01-09T14:30:45.999Z").unwrap();
        assert_eq!(floor_to_hour(ts), Utc.with_ymd_and_hms(2025, 1, 9, 14, 0, 0).unwrap());
    }
}
