#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use usage_window::engine::{EngineSettings, UsageEngine};
use usage_window::litellm_pricing::PricingManager;
use usage_window::pricing::ModelWeights;

/// An instant on the fixed test day.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 9, hour, minute, 0).unwrap()
}

pub fn builtin_engine() -> UsageEngine {
    UsageEngine::new(
        EngineSettings::default(),
        Arc::new(PricingManager::builtin(ModelWeights::default())),
    )
}

/// Flat record shape with ids.
pub fn usage_record(ts: DateTime<Utc>, model: &str, tokens: u64, message_id: &str) -> Value {
    json!({
        "timestamp": ts.to_rfc3339(),
        "model_name": model,
        "usage": {"input_tokens": tokens, "output_tokens": 0},
        "message_id": message_id,
        "request_id": format!("req_{message_id}"),
    })
}

/// Native session-log shape, as written by the assistant.
pub fn native_line(ts: DateTime<Utc>, model: &str, input: u64, output: u64, id: &str, cost: Option<f64>) -> String {
    let mut value = json!({
        "timestamp": ts.to_rfc3339(),
        "requestId": format!("req_{id}"),
        "message": {
            "id": id,
            "model": model,
            "usage": {
                "input_tokens": input,
                "output_tokens": output,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 0
            },
            "content": [{"type": "tool_use", "name": "Read"}]
        }
    });
    if let Some(cost) = cost {
        value["costUSD"] = json!(cost);
    }
    value.to_string()
}

/// Write `<root>/<project>/<session>.jsonl` with one line per entry.
pub fn write_session_log(root: &Path, project: &str, session: &str, lines: &[String]) -> Result<PathBuf> {
    let dir = root.join(project);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{session}.jsonl"));
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(&path, content)?;
    Ok(path)
}

/// Two projects, three sessions, all inside the 14:00 window.
pub fn setup_projects_dir() -> Result<TempDir> {
    let dir = TempDir::new()?;
    write_session_log(
        dir.path(),
        "-home-dev-api",
        "sess-a",
        &[
            native_line(at(14, 5), "claude-sonnet-4-20250514", 1000, 500, "msg_a1", Some(0.25)),
            native_line(at(14, 40), "claude-sonnet-4-20250514", 2000, 500, "msg_a2", Some(0.5)),
        ],
    )?;
    write_session_log(
        dir.path(),
        "-home-dev-api",
        "sess-b",
        &[native_line(at(15, 10), "claude-opus-4-20250514", 100, 100, "msg_b1", None)],
    )?;
    write_session_log(
        dir.path(),
        "-home-dev-web",
        "sess-c",
        &[
            native_line(at(15, 20), "claude-3-5-haiku-20241022", 300, 200, "msg_c1", None),
            // Replayed line from a restarted writer.
            native_line(at(15, 20), "claude-3-5-haiku-20241022", 300, 200, "msg_c1", None),
            "{\"type\":\"summary\",\"summary\":\"no usage here\"}".to_string(),
        ],
    )?;
    Ok(dir)
}
