//! Persisted state between runs
//!
//! Kept: the dedup keys, how far each log file has been read, and the recent
//! blocks of every session (those that can still fall inside the current or
//! most recently completed window). Older history is not persisted.

use crate::dedup::DedupKey;
use crate::error::EngineError;
use crate::models::Session;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Bump whenever the layout below or the dedup key format changes.
pub const CACHE_SCHEMA_VERSION: u32 = 4;

/// Blocks built without tool tracking have no tool counts, so a cache written
/// with a different setting cannot be trusted either.
pub const TOOL_TRACKING_ENABLED: bool = true;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCache {
    pub schema_version: u32,
    pub tool_tracking_enabled: bool,
    #[serde(default)]
    pub dedup_keys: Vec<DedupKey>,
    /// Byte offset already consumed, per log file path.
    #[serde(default)]
    pub tailer_positions: BTreeMap<String, u64>,
    /// Trailing blocks of each session, enough to rebuild the current window.
    #[serde(default)]
    pub sessions: Vec<Session>,
}

/// The fields checked before the rest of the file is trusted.
#[derive(Deserialize)]
struct CacheHeader {
    schema_version: u32,
    tool_tracking_enabled: bool,
}

impl Default for PersistedCache {
    fn default() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            tool_tracking_enabled: TOOL_TRACKING_ENABLED,
            dedup_keys: Vec::new(),
            tailer_positions: BTreeMap::new(),
            sessions: Vec::new(),
        }
    }
}

impl PersistedCache {
    pub fn is_empty(&self) -> bool {
        self.dedup_keys.is_empty() && self.tailer_positions.is_empty() && self.sessions.is_empty()
    }

    /// Decode and check compatibility with this build.
    pub fn from_json(content: &str) -> Result<Self, EngineError> {
        let header: CacheHeader = serde_json::from_str(content)
            .map_err(|e| EngineError::CacheSchemaMismatch(format!("unreadable cache: {e}")))?;

        if header.schema_version != CACHE_SCHEMA_VERSION {
            return Err(EngineError::CacheSchemaMismatch(format!(
                "schema version {} (expected {})",
                header.schema_version, CACHE_SCHEMA_VERSION
            )));
        }
        if header.tool_tracking_enabled != TOOL_TRACKING_ENABLED {
            return Err(EngineError::CacheSchemaMismatch(format!(
                "tool tracking {} (expected {})",
                header.tool_tracking_enabled, TOOL_TRACKING_ENABLED
            )));
        }

        serde_json::from_str(content)
            .map_err(|e| EngineError::CacheSchemaMismatch(format!("unreadable cache: {e}")))
    }

    /// Load the cache at `path`. A missing file is a first run; anything
    /// unusable is logged and replaced with an empty cache so the caller
    /// rebuilds from full history.
    pub fn load_or_rebuild(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No cache found, starting from full history");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cache unreadable, rebuilding");
                return Self::default();
            }
        };

        match Self::from_json(&content) {
            Ok(cache) => {
                info!(
                    path = %path.display(),
                    dedup_keys = cache.dedup_keys.len(),
                    files = cache.tailer_positions.len(),
                    sessions = cache.sessions.len(),
                    "Loaded cache"
                );
                cache
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding cache, rebuilding");
                Self::default()
            }
        }
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let json = serde_json::to_string(self).context("Failed to serialize cache")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write cache file {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move cache into place at {}", path.display()))?;

        info!(
            path = %path.display(),
            dedup_keys = self.dedup_keys.len(),
            files = self.tailer_positions.len(),
            sessions = self.sessions.len(),
            "Cache checkpoint written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Block, ModelFamily};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn key(message_id: &str, request_id: &str) -> DedupKey {
        (message_id.to_string(), request_id.to_string())
    }

    fn sample() -> PersistedCache {
        let start = Utc.with_ymd_and_hms(2025, 1, 9, 14, 0, 0).unwrap();
        let mut block = Block::new(start, Duration::hours(5), start + Duration::minutes(5));
        block.model_tokens.insert(ModelFamily::Haiku, 2.5);
        block.message_count = 1;
        let mut session = Session::new("s".to_string(), "p".to_string());
        session.blocks.push(block);

        PersistedCache {
            dedup_keys: vec![key("msg_1", "req_1"), key("msg:2", "req_2")],
            tailer_positions: BTreeMap::from([("/logs/p/s.jsonl".to_string(), 4096)]),
            sessions: vec![session],
            ..PersistedCache::default()
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        sample().save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(PersistedCache::load_or_rebuild(&path), sample());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = PersistedCache::load_or_rebuild(&dir.path().join("absent.json"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_version_mismatch_rebuilds() {
        let content = serde_json::json!({
            "schema_version": CACHE_SCHEMA_VERSION + 1,
            "tool_tracking_enabled": TOOL_TRACKING_ENABLED,
            "dedup_keys": [["a", "b"]],
            "tailer_positions": {}
        })
        .to_string();

        let err = PersistedCache::from_json(&content).unwrap_err();
        assert!(matches!(err, EngineError::CacheSchemaMismatch(_)));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, content).unwrap();
        assert!(PersistedCache::load_or_rebuild(&path).is_empty());
    }

    #[test]
    fn test_tool_tracking_mismatch_rebuilds() {
        let content = serde_json::json!({
            "schema_version": CACHE_SCHEMA_VERSION,
            "tool_tracking_enabled": !TOOL_TRACKING_ENABLED,
            "dedup_keys": [["a", "b"]]
        })
        .to_string();
        assert!(PersistedCache::from_json(&content).is_err());
    }

    #[test]
    fn test_garbage_rebuilds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();
        assert!(PersistedCache::load_or_rebuild(&path).is_empty());
    }

    #[test]
    fn test_previous_layout_is_a_version_mismatch() {
        let content = serde_json::json!({
            "schema_version": 3,
            "tool_tracking_enabled": TOOL_TRACKING_ENABLED,
            "dedup_keys": ["a:b"],
            "tailer_positions": {}
        })
        .to_string();

        match PersistedCache::from_json(&content) {
            Err(EngineError::CacheSchemaMismatch(reason)) => assert!(reason.contains("schema version 3")),
            other => panic!("expected a schema mismatch, got {other:?}"),
        }
    }
}
