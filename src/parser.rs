//! Event Parser/Validator
//!
//! Turns one raw decoded record into a typed [`UsageEvent`] or rejects it.
//! Both the flat logical shape (`model_name`, `usage`, `message_id`,
//! `tool_use`, `was_interrupted`, `cost`) and the native session-log shape
//! (`message.{id,model,usage,content}`, `requestId`, `costUSD`) are accepted.
//!
//! Nothing here clamps or guesses: an unparseable timestamp or a negative
//! token count rejects the whole record.

use crate::error::{EngineError, EngineResult, Rejection};
use crate::models::{ModelFamily, TokenCounts, UsageEvent};
use crate::timestamp_parser::TimestampParser;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

const INTERRUPTED_MARKER: &str = "[Request interrupted by user";

/// Caller-supplied identity of the stream a record came from.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub project_id: String,
    pub session_id: String,
}

impl EventContext {
    pub fn new(project_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// Optional clock-anomaly bounds. Without `now` no range check happens.
#[derive(Debug, Clone, Default)]
pub struct ClockBounds {
    pub now: Option<DateTime<Utc>>,
    pub max_future_skew: Option<Duration>,
    pub max_age: Option<Duration>,
}

impl ClockBounds {
    pub fn new(now: DateTime<Utc>, max_future_skew: Duration, max_age: Duration) -> Self {
        Self {
            now: Some(now),
            max_future_skew: Some(max_future_skew),
            max_age: Some(max_age),
        }
    }

    fn check(&self, timestamp: DateTime<Utc>) -> EngineResult<()> {
        let Some(now) = self.now else {
            return Ok(());
        };
        // A bound too large to represent rules nothing out.
        let latest = self.max_future_skew.and_then(|skew| now.checked_add_signed(skew));
        if latest.is_some_and(|latest| timestamp > latest) {
            return Err(EngineError::Validation(Rejection::TimestampOutOfRange));
        }
        let earliest = self.max_age.and_then(|age| now.checked_sub_signed(age));
        if earliest.is_some_and(|earliest| timestamp < earliest) {
            return Err(EngineError::Validation(Rejection::TimestampOutOfRange));
        }
        Ok(())
    }
}

pub struct EventParser {
    bounds: ClockBounds,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new(ClockBounds::default())
    }
}

impl EventParser {
    pub fn new(bounds: ClockBounds) -> Self {
        Self { bounds }
    }

    pub fn with_now(&self, now: DateTime<Utc>) -> Self {
        Self {
            bounds: ClockBounds {
                now: Some(now),
                ..self.bounds.clone()
            },
        }
    }

    pub fn parse(&self, record: &Value, ctx: &EventContext) -> EngineResult<UsageEvent> {
        let obj = record
            .as_object()
            .ok_or(EngineError::Parse(Rejection::NotAnObject))?;
        let message = obj.get("message").and_then(Value::as_object);

        let timestamp = parse_timestamp_field(obj.get("timestamp"))?;
        self.bounds.check(timestamp)?;

        let usage = message
            .and_then(|m| m.get("usage"))
            .or_else(|| obj.get("usage"))
            .and_then(Value::as_object)
            .ok_or(EngineError::Parse(Rejection::MissingUsage))?;
        let tokens = parse_usage(usage)?;

        let model_name = message
            .and_then(|m| m.get("model"))
            .or_else(|| obj.get("model_name"))
            .or_else(|| obj.get("model"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let family = ModelFamily::classify(&model_name);

        let message_id = message
            .and_then(|m| m.get("id"))
            .or_else(|| obj.get("message_id"))
            .and_then(non_empty_str);
        let request_id = obj
            .get("requestId")
            .or_else(|| obj.get("request_id"))
            .and_then(non_empty_str);

        let native_cost = match obj
            .get("costUSD")
            .or_else(|| obj.get("cost_usd"))
            .or_else(|| obj.get("cost"))
        {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .ok_or(EngineError::Parse(Rejection::InvalidField("cost")))?,
            ),
        };

        let content = message.and_then(|m| m.get("content")).and_then(Value::as_array);
        let tool_names = collect_tool_names(obj, content);
        let was_interrupted = obj
            .get("was_interrupted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || content.is_some_and(|items| items.iter().any(is_interruption));

        Ok(UsageEvent {
            timestamp,
            project_id: ctx.project_id.clone(),
            session_id: ctx.session_id.clone(),
            model_name,
            family,
            tokens,
            message_id,
            request_id,
            tool_names,
            was_interrupted,
            native_cost,
        })
    }
}

fn parse_timestamp_field(value: Option<&Value>) -> EngineResult<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Err(EngineError::Validation(Rejection::MissingTimestamp)),
        Some(Value::String(s)) => TimestampParser::parse(s)
            .ok_or_else(|| EngineError::Validation(Rejection::UnparseableTimestamp(s.clone()))),
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(TimestampParser::from_unix_seconds)
            .ok_or_else(|| EngineError::Validation(Rejection::UnparseableTimestamp(n.to_string()))),
        Some(other) => Err(EngineError::Validation(Rejection::UnparseableTimestamp(
            other.to_string(),
        ))),
    }
}

fn parse_usage(usage: &Map<String, Value>) -> EngineResult<TokenCounts> {
    Ok(TokenCounts {
        input_tokens: token_field(usage, &["input_tokens"], "input_tokens")?,
        output_tokens: token_field(usage, &["output_tokens"], "output_tokens")?,
        cache_creation_tokens: token_field(
            usage,
            &["cache_creation_input_tokens", "cache_creation_tokens"],
            "cache_creation_tokens",
        )?,
        cache_read_tokens: token_field(
            usage,
            &["cache_read_input_tokens", "cache_read_tokens"],
            "cache_read_tokens",
        )?,
    })
}

fn token_field(usage: &Map<String, Value>, keys: &[&str], kind: &'static str) -> EngineResult<u64> {
    let Some(value) = keys.iter().find_map(|k| usage.get(*k)) else {
        return Ok(0);
    };
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Ok(v)
            } else if n.as_i64().is_some_and(|v| v < 0) || n.as_f64().is_some_and(|v| v < 0.0) {
                Err(EngineError::Validation(Rejection::NegativeTokens(kind)))
            } else {
                Err(EngineError::Parse(Rejection::InvalidField(kind)))
            }
        }
        _ => Err(EngineError::Parse(Rejection::InvalidField(kind))),
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn collect_tool_names(obj: &Map<String, Value>, content: Option<&Vec<Value>>) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(tools) = obj.get("tool_use").and_then(Value::as_array) {
        names.extend(
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string),
        );
    }

    if let Some(items) = content {
        names.extend(
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
                .filter_map(|item| item.get("name").and_then(Value::as_str))
                .map(str::to_string),
        );
    }

    names
}

fn is_interruption(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("text")
        && item
            .get("text")
            .and_then(Value::as_str)
            .is_some_and(|t| t.starts_with(INTERRUPTED_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> EventContext {
        EventContext::new("proj", "sess")
    }

    #[test]
    fn test_parse_native_shape() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00Z",
            "requestId": "req_1",
            "costUSD": 0.25,
            "message": {
                "id": "msg_1",
                "model": "claude-3-opus-20240229",
                "usage": {
                    "input_tokens": 100,
                    "output_tokens": 50,
                    "cache_creation_input_tokens": 10,
                    "cache_read_input_tokens": 20
                },
                "content": [
                    {"type": "tool_use", "name": "Read", "input": {}},
                    {"type": "tool_use", "name": "Bash", "input": {}}
                ]
            }
        });

        let event = EventParser::default().parse(&record, &ctx()).unwrap();
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2025, 1, 9, 10, 3, 0).unwrap());
        assert_eq!(event.family, ModelFamily::Opus);
        assert_eq!(event.tokens.total(), 180);
        assert_eq!(event.message_id.as_deref(), Some("msg_1"));
        assert_eq!(event.request_id.as_deref(), Some("req_1"));
        assert_eq!(event.tool_names, vec!["Read", "Bash"]);
        assert_eq!(event.native_cost, Some(0.25));
        assert!(!event.was_interrupted);
        assert_eq!(event.project_id, "proj");
    }

    #[test]
    fn test_parse_logical_shape() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00+00:00",
            "model_name": "claude-sonnet-4-20250514",
            "usage": {"input_tokens": 5, "output_tokens": 7, "cache_creation_tokens": 1, "cache_read_tokens": 2},
            "message_id": "m",
            "request_id": "r",
            "tool_use": [{"name": "Edit"}],
            "was_interrupted": true,
            "cost": null
        });

        let event = EventParser::default().parse(&record, &ctx()).unwrap();
        assert_eq!(event.family, ModelFamily::Sonnet);
        assert_eq!(event.tokens.cache_creation_tokens, 1);
        assert_eq!(event.tokens.cache_read_tokens, 2);
        assert_eq!(event.tool_names, vec!["Edit"]);
        assert!(event.was_interrupted);
        assert_eq!(event.native_cost, None);
    }

    #[test]
    fn test_interruption_marker_in_content() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00Z",
            "message": {
                "model": "claude-3-haiku-20240307",
                "usage": {"input_tokens": 1, "output_tokens": 1},
                "content": [{"type": "text", "text": "[Request interrupted by user for tool use]"}]
            }
        });
        let event = EventParser::default().parse(&record, &ctx()).unwrap();
        assert!(event.was_interrupted);
        assert_eq!(event.message_id, None);
    }

    #[test]
    fn test_missing_model_is_unknown_not_error() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00Z",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let event = EventParser::default().parse(&record, &ctx()).unwrap();
        assert_eq!(event.family, ModelFamily::Unknown);
        assert_eq!(event.model_name, "");
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let record = json!({"timestamp": "yesterday", "usage": {"input_tokens": 1}});
        let err = EventParser::default().parse(&record, &ctx()).unwrap_err();
        assert!(err.is_validation());

        let record = json!({"usage": {"input_tokens": 1}});
        let err = EventParser::default().parse(&record, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(Rejection::MissingTimestamp)));
    }

    #[test]
    fn test_rejects_negative_tokens() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00Z",
            "usage": {"input_tokens": 10, "output_tokens": -5}
        });
        let err = EventParser::default().parse(&record, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(Rejection::NegativeTokens("output_tokens"))
        ));
    }

    #[test]
    fn test_rejects_malformed_fields() {
        let record = json!({
            "timestamp": "2025-01-09T10:03:00Z",
            "usage": {"input_tokens": "lots"}
        });
        assert!(EventParser::default().parse(&record, &ctx()).unwrap_err().is_parse());

        let record = json!({"timestamp": "2025-01-09T10:03:00Z"});
        assert!(matches!(
            EventParser::default().parse(&record, &ctx()).unwrap_err(),
            EngineError::Parse(Rejection::MissingUsage)
        ));

        assert!(EventParser::default().parse(&json!([1, 2]), &ctx()).unwrap_err().is_parse());
    }

    #[test]
    fn test_clock_anomaly_is_validation_rejection() {
        let now = Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap();
        let parser = EventParser::new(ClockBounds::new(now, Duration::minutes(10), Duration::days(30)));

        let future = json!({"timestamp": "2025-01-10T12:00:00Z", "usage": {"input_tokens": 1}});
        assert!(matches!(
            parser.parse(&future, &ctx()).unwrap_err(),
            EngineError::Validation(Rejection::TimestampOutOfRange)
        ));

        let ancient = json!({"timestamp": "2020-01-01T00:00:00Z", "usage": {"input_tokens": 1}});
        assert!(parser.parse(&ancient, &ctx()).unwrap_err().is_validation());

        let fine = json!({"timestamp": "2025-01-09T11:59:00Z", "usage": {"input_tokens": 1}});
        assert!(parser.parse(&fine, &ctx()).is_ok());
    }

    #[test]
    fn test_unrepresentable_clock_bounds_accept_everything() {
        let now = Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap();
        // Far beyond the calendar range chrono can represent.
        let huge = Duration::days(100_000_000_000);
        let parser = EventParser::new(ClockBounds::new(now, huge, huge));

        let ancient = json!({"timestamp": "1970-01-02T00:00:00Z", "usage": {"input_tokens": 1}});
        assert!(parser.parse(&ancient, &ctx()).is_ok());
    }
}
