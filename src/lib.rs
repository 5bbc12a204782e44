//! Usage Window Library
//!
//! Aggregates token usage from many concurrent coding-assistant sessions into
//! rolling 5-hour accounting blocks, and answers one question across all of
//! them: which single window is current, and how much was used inside it.
//!
//! ## Architecture Overview
//!
//! - [`parser`] - Validates raw JSON records into typed [`models::UsageEvent`]s
//! - [`dedup`] - Suppresses events already counted, keyed by message and request id
//! - [`blocks`] - Folds events into per-session 5-hour blocks with gap markers
//! - [`pricing`] / [`litellm_pricing`] - Model price table and its async sources
//! - [`cost`] - Native-first cost attribution with computed fallback
//! - [`window`] - Picks the unified window across every session
//! - [`snapshot`] - Windowed aggregates as a serialisable report
//! - [`engine`] - Ties the above together behind one lock
//! - [`cache`] - Dedup keys and read offsets persisted between runs
//! - [`file_discovery`] / [`monitor`] / [`display`] - JSONL tailing, polling loop and output
//! - [`config`] / [`logging`] - Layered configuration and structured logging
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use usage_window::engine::{EngineSettings, UsageEngine};
//! use usage_window::litellm_pricing::PricingManager;
//! use usage_window::parser::EventContext;
//! use usage_window::pricing::ModelWeights;
//!
//! # async fn example() {
//! let pricing = Arc::new(PricingManager::builtin(ModelWeights::default()));
//! let engine = UsageEngine::new(EngineSettings::default(), pricing);
//!
//! let record = serde_json::json!({
//!     "timestamp": "2025-01-09T10:03:00Z",
//!     "model_name": "claude-sonnet-4-20250514",
//!     "usage": {"input_tokens": 1200, "output_tokens": 300},
//!     "message_id": "msg_1",
//!     "request_id": "req_1",
//! });
//! let now = chrono::Utc::now();
//! engine.ingest(&record, &EventContext::new("my-project", "session-a"), now);
//!
//! let report = engine.snapshot(now, None).await;
//! println!("{} tokens in window", report.windowed_tokens);
//! # }
//! ```

pub mod blocks;
pub mod cache;
pub mod config;
pub mod cost;
pub mod dedup;
pub mod display;
pub mod engine;
pub mod error;
pub mod file_discovery;
pub mod litellm_pricing;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod parser;
pub mod pricing;
pub mod snapshot;
pub mod timestamp_parser;
pub mod window;

pub use engine::{EngineSettings, IngestOutcome, IngestStats, UsageEngine};
pub use error::{EngineError, EngineResult, Rejection};
pub use models::*;
pub use snapshot::{Snapshot, SnapshotReport};
