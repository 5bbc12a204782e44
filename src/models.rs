//! Core Data Models
//!
//! This module defines the data structures the aggregation engine works on.
//! They represent the pipeline from a validated usage event to the per-session
//! block lists that window selection and aggregation read.
//!
//! ## Data Flow
//!
//! 1. **Ingest**: [`UsageEvent`] - One validated, typed message from a session log
//! 2. **Accounting**: [`Block`] - A 5-hour accounting unit that events are folded into
//! 3. **Grouping**: [`Session`] and [`Project`] - Ordered block lists keyed by id
//!
//! ## Closed Classifications
//!
//! - [`ModelFamily`] - The small set of model families weights are keyed on
//! - [`CostSource`] - Where a reported cost came from
//!
//! Blocks never close explicitly. Whether a block is active is a function of
//! the current instant, its `end` and its `last_activity`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BLOCK_DURATION_HOURS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Opus,
    Sonnet,
    Haiku,
    Unknown,
}

impl ModelFamily {
    /// Classify a raw model name by case-insensitive substring match.
    /// Blank and placeholder names map to `Unknown`, never to an error.
    pub fn classify(model_name: &str) -> Self {
        if Self::is_placeholder(model_name) {
            return ModelFamily::Unknown;
        }

        let lower = model_name.to_ascii_lowercase();
        if lower.contains("opus") {
            ModelFamily::Opus
        } else if lower.contains("sonnet") {
            ModelFamily::Sonnet
        } else if lower.contains("haiku") {
            ModelFamily::Haiku
        } else {
            ModelFamily::Unknown
        }
    }

    /// Blank or sentinel names that carry no model information at all.
    pub fn is_placeholder(model_name: &str) -> bool {
        matches!(
            model_name.trim().to_ascii_lowercase().as_str(),
            "" | "unknown" | "none" | "null" | "<synthetic>"
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Opus => "opus",
            ModelFamily::Sonnet => "sonnet",
            ModelFamily::Haiku => "haiku",
            ModelFamily::Unknown => "unknown",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelFamily::Opus => "Opus",
            ModelFamily::Sonnet => "Sonnet",
            ModelFamily::Haiku => "Haiku",
            ModelFamily::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
    Native,
    Computed,
    Unpriced,
}

impl std::fmt::Display for CostSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CostSource::Native => "native",
            CostSource::Computed => "computed",
            CostSource::Unpriced => "unpriced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "cacheCreationTokens")]
    pub cache_creation_tokens: u64,
    #[serde(rename = "cacheReadTokens")]
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    /// Sum of all four kinds, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.cache_read_tokens)
    }

    pub fn add(&mut self, other: &TokenCounts) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_tokens = self.cache_creation_tokens.saturating_add(other.cache_creation_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }
}

/// One ingested message. Immutable once built by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub session_id: String,
    pub model_name: String,
    pub family: ModelFamily,
    pub tokens: TokenCounts,
    pub message_id: Option<String>,
    pub request_id: Option<String>,
    pub tool_names: Vec<String>,
    pub was_interrupted: bool,
    pub native_cost: Option<f64>,
}

/// A 5-hour accounting unit for one session, or a gap marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(rename = "isGap")]
    pub is_gap: bool,
    #[serde(rename = "firstActivity")]
    pub first_activity: DateTime<Utc>,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
    /// Weighted token totals per model family. Kept fractional so that
    /// weighting stays linear in the raw counts.
    #[serde(rename = "modelTokens")]
    pub model_tokens: BTreeMap<ModelFamily, f64>,
    /// Unweighted token counts per full model name, for pricing.
    #[serde(rename = "rawTokens")]
    pub raw_tokens: BTreeMap<String, TokenCounts>,
    #[serde(rename = "modelMessageCounts")]
    pub model_message_counts: BTreeMap<ModelFamily, u32>,
    #[serde(rename = "toolCounts")]
    pub tool_counts: BTreeMap<String, u32>,
    #[serde(rename = "messageCount")]
    pub message_count: u32,
    #[serde(rename = "interruptedCount")]
    pub interrupted_count: u32,
    #[serde(rename = "nativeCostTotal")]
    pub native_cost_total: Option<f64>,
    #[serde(rename = "nativeCostCount")]
    pub native_cost_count: u32,
}

impl Block {
    pub fn new(start: DateTime<Utc>, duration: Duration, first_activity: DateTime<Utc>) -> Self {
        Self {
            start,
            end: start + duration,
            is_gap: false,
            first_activity,
            last_activity: first_activity,
            model_tokens: BTreeMap::new(),
            raw_tokens: BTreeMap::new(),
            model_message_counts: BTreeMap::new(),
            tool_counts: BTreeMap::new(),
            message_count: 0,
            interrupted_count: 0,
            native_cost_total: None,
            native_cost_count: 0,
        }
    }

    /// A placeholder explaining a silence between `start` and `end`.
    pub fn gap(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            is_gap: true,
            end,
            ..Self::new(start, Duration::zero(), start)
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Active while `now` is before `end` and the last activity is less than
    /// one block duration old. Gap blocks are never active.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_gap && now < self.end && now - self.last_activity < self.duration()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Half-open interval overlap with `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }

    pub fn total_weighted_tokens(&self) -> f64 {
        self.model_tokens.values().sum()
    }

    pub fn total_raw_tokens(&self) -> u64 {
        self.raw_tokens
            .values()
            .fold(0u64, |acc, t| acc.saturating_add(t.total()))
    }

    /// Minutes between first and last folded event.
    pub fn activity_minutes(&self) -> f64 {
        (self.last_activity - self.first_activity).num_seconds().max(0) as f64 / 60.0
    }

    /// Weighted tokens per minute of elapsed block time.
    pub fn burn_rate(&self, now: DateTime<Utc>) -> f64 {
        if self.is_gap {
            return 0.0;
        }
        let elapsed = (now.min(self.end) - self.start).num_seconds() as f64 / 60.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_weighted_tokens() / elapsed
    }

    /// True when every folded event carried a native cost.
    pub fn has_complete_native_cost(&self) -> bool {
        self.message_count > 0 && self.native_cost_count == self.message_count
    }
}

/// Ordered blocks of one conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub blocks: Vec<Block>,
}

impl Session {
    pub fn new(session_id: String, project_id: String) -> Self {
        Self {
            session_id,
            project_id,
            blocks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub sessions: BTreeMap<String, Session>,
}

impl Project {
    pub fn new(project_id: String) -> Self {
        Self {
            project_id,
            sessions: BTreeMap::new(),
        }
    }

    pub fn session_mut(&mut self, session_id: &str) -> &mut Session {
        let project_id = self.project_id.clone();
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string(), project_id))
    }

}

pub type ProjectMap = BTreeMap<String, Project>;
