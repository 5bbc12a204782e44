//! End-to-end behaviour of the aggregation engine on fixed clocks

mod common;

use chrono::Duration;
use common::{at, builtin_engine, usage_record};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use usage_window::blocks::FoldOutcome;
use usage_window::engine::{EngineSettings, IngestOutcome, UsageEngine};
use usage_window::litellm_pricing::PricingManager;
use usage_window::models::{ModelFamily, ProjectMap};
use usage_window::parser::EventContext;
use usage_window::pricing::{ModelCostTable, ModelWeights};
use usage_window::snapshot::Snapshot;
use usage_window::window;

#[test]
fn test_events_within_an_hour_share_a_block() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");

    engine.ingest(&usage_record(at(10, 3), "claude-sonnet-4-20250514", 100, "m1"), &ctx, at(11, 0));
    engine.ingest(&usage_record(at(10, 47), "claude-sonnet-4-20250514", 200, "m2"), &ctx, at(11, 0));

    let projects = engine.projects();
    let blocks = &projects["p"].sessions["s"].blocks;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].start, at(10, 0));
    assert_eq!(blocks[0].message_count, 2);
    assert_eq!(blocks[0].total_weighted_tokens(), 300.0);
}

#[test]
fn test_long_silence_inserts_gap() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");

    engine.ingest(&usage_record(at(10, 3), "claude-sonnet-4-20250514", 100, "m1"), &ctx, at(17, 0));
    let outcome = engine.ingest(&usage_record(at(16, 10), "claude-sonnet-4-20250514", 100, "m2"), &ctx, at(17, 0));
    assert_eq!(outcome, IngestOutcome::Folded(FoldOutcome::NewBlockAfterGap));

    let projects = engine.projects();
    let blocks = &projects["p"].sessions["s"].blocks;
    assert_eq!(blocks.len(), 3);
    assert_eq!((blocks[0].start, blocks[0].end), (at(10, 0), at(15, 0)));
    assert!(blocks[1].is_gap);
    assert_eq!((blocks[1].start, blocks[1].end), (at(15, 0), at(16, 0)));
    assert_eq!(blocks[2].start, at(16, 0));
}

#[test]
fn test_blocks_stay_contiguous() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");
    let times = [
        at(1, 15),
        at(2, 0),
        at(5, 59),
        at(6, 30),
        at(13, 5),
        at(13, 6),
        at(18, 10),
        at(23, 50),
    ];
    for (i, ts) in times.iter().enumerate() {
        engine.ingest(
            &usage_record(*ts, "claude-sonnet-4-20250514", 10, &format!("m{i}")),
            &ctx,
            at(23, 59),
        );
    }

    let projects = engine.projects();
    let blocks = &projects["p"].sessions["s"].blocks;
    for pair in blocks.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        if pair[0].end < pair[1].start {
            panic!("uncovered silence between {} and {}", pair[0].end, pair[1].start);
        }
    }
    assert_eq!(engine.stats().folded, times.len() as u64);
}

#[test]
fn test_selector_prefers_block_containing_now() {
    let engine = builtin_engine();
    let now = at(15, 30);
    engine.ingest(&usage_record(at(14, 10), "claude-sonnet-4", 10, "x1"), &EventContext::new("p", "x"), now);
    engine.ingest(&usage_record(at(15, 25), "claude-sonnet-4", 10, "y1"), &EventContext::new("p", "y"), now);

    assert_eq!(engine.unified_window_start(now), Some(at(14, 0)));
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let once = builtin_engine();
    let twice = builtin_engine();
    let ctx = EventContext::new("p", "s");
    let now = at(10, 30);
    let record = usage_record(at(10, 3), "claude-opus-4-20250514", 1234, "m1");

    once.ingest(&record, &ctx, now);
    twice.ingest(&record, &ctx, now);
    twice.ingest(&record, &ctx, now);

    let a = once.snapshot(now, None).await;
    let b = twice.snapshot(now, None).await;
    assert_eq!(a.windowed_tokens, b.windowed_tokens);
    assert_eq!(a.cost.total, b.cost.total);
    assert_eq!(twice.stats().duplicates, 1);
}

#[test]
fn test_events_without_ids_are_always_folded() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");
    let record = json!({
        "timestamp": at(10, 3).to_rfc3339(),
        "model_name": "claude-sonnet-4",
        "usage": {"input_tokens": 10, "output_tokens": 0},
        "message_id": "only-half",
    });

    engine.ingest(&record, &ctx, at(10, 30));
    engine.ingest(&record, &ctx, at(10, 30));
    assert_eq!(engine.stats().folded, 2);
    assert_eq!(engine.stats().duplicates, 0);
}

#[tokio::test]
async fn test_window_span_is_block_duration() {
    let engine = builtin_engine();
    let now = at(12, 0);
    engine.ingest(&usage_record(at(11, 59), "claude-sonnet-4", 10, "m"), &EventContext::new("p", "s"), now);

    let report = engine.snapshot(now, None).await;
    let start = report.window_start.unwrap();
    assert_eq!(report.window_end, Some(start + Duration::hours(5)));
}

#[tokio::test]
async fn test_idle_everything_zero() {
    let engine = builtin_engine();
    engine.ingest(&usage_record(at(1, 0), "claude-sonnet-4", 10, "m"), &EventContext::new("p", "s"), at(1, 5));

    let report = engine.snapshot(at(22, 0), None).await;
    assert_eq!(report.window_start, None);
    assert_eq!(report.windowed_tokens, 0.0);
    assert!(report.tokens_by_model.is_empty());
    assert_eq!(report.cost.total, 0.0);
    assert_eq!(report.active_projects, 0);
    assert_eq!(report.active_sessions, 0);
}

#[test]
fn test_doubling_tokens_doubles_weighted_total() {
    for model in ["claude-opus-4-20250514", "claude-sonnet-4-20250514", "claude-3-5-haiku-20241022"] {
        let single = builtin_engine();
        let double = builtin_engine();
        let ctx = EventContext::new("p", "s");
        single.ingest(&usage_record(at(10, 3), model, 777, "m"), &ctx, at(10, 30));
        double.ingest(&usage_record(at(10, 3), model, 1554, "m"), &ctx, at(10, 30));

        let family = ModelFamily::classify(model);
        let weighted = |projects: ProjectMap| projects["p"].sessions["s"].blocks[0].model_tokens[&family];
        assert_eq!(weighted(double.projects()), 2.0 * weighted(single.projects()), "{model}");
    }
}

#[tokio::test]
async fn test_doubling_holds_for_fractional_weights() {
    let weights = ModelWeights::new(HashMap::from([(ModelFamily::Haiku, 0.5)]));
    let engine = || {
        UsageEngine::new(
            EngineSettings {
                weights: weights.clone(),
                ..EngineSettings::default()
            },
            Arc::new(PricingManager::builtin(weights.clone())),
        )
    };
    let ctx = EventContext::new("p", "s");

    let single = engine();
    let double = engine();
    for (i, tokens) in [1u64, 3, 7].into_iter().enumerate() {
        let id = format!("m{i}");
        single.ingest(&usage_record(at(10, 3), "claude-3-5-haiku", tokens, &id), &ctx, at(10, 30));
        double.ingest(&usage_record(at(10, 3), "claude-3-5-haiku", 2 * tokens, &id), &ctx, at(10, 30));
    }

    let single = single.snapshot(at(10, 30), None).await;
    let double = double.snapshot(at(10, 30), None).await;
    assert_eq!(single.windowed_tokens, 5.5);
    assert_eq!(double.windowed_tokens, 2.0 * single.windowed_tokens);
    assert_eq!(
        double.tokens_by_model[&ModelFamily::Haiku],
        2.0 * single.tokens_by_model[&ModelFamily::Haiku]
    );
}

#[tokio::test]
async fn test_maximal_token_counts_fold_without_panicking() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");
    let huge = json!({
        "timestamp": at(10, 3).to_rfc3339(),
        "model_name": "claude-sonnet-4",
        "usage": {"input_tokens": u64::MAX, "output_tokens": 1},
        "message_id": "big",
        "request_id": "r",
    });

    assert_eq!(
        engine.ingest(&huge, &ctx, at(10, 30)),
        IngestOutcome::Folded(FoldOutcome::NewBlock)
    );
    engine.ingest(&usage_record(at(10, 4), "claude-sonnet-4", 10, "after"), &ctx, at(10, 30));

    let projects = engine.projects();
    let block = &projects["p"].sessions["s"].blocks[0];
    assert_eq!(block.total_raw_tokens(), u64::MAX);
    assert_eq!(block.message_count, 2);

    let report = engine.snapshot(at(10, 30), None).await;
    assert!(report.windowed_tokens.is_finite());
    assert!(report.cost.total.is_finite());
}

#[test]
fn test_custom_family_variant_uses_family_weight_and_price() {
    let engine = builtin_engine();
    let ctx = EventContext::new("p", "s");
    engine.ingest(&usage_record(at(10, 3), "custom-opus-variant", 1000, "m"), &ctx, at(10, 30));

    let projects = engine.projects();
    let block = &projects["p"].sessions["s"].blocks[0];
    assert_eq!(block.model_tokens[&ModelFamily::Opus], 5000.0);

    let table = ModelCostTable::builtin(ModelWeights::default());
    let fallback = table.price("custom-opus-variant").expect("family fallback");
    assert_eq!(fallback.input_cost_per_token, 15e-6);
}

#[test]
fn test_overridden_window_used_verbatim() {
    let engine = builtin_engine();
    let now = at(15, 30);
    engine.ingest(&usage_record(at(14, 10), "claude-sonnet-4", 10, "a"), &EventContext::new("p", "a"), now);
    engine.ingest(&usage_record(at(15, 5), "claude-sonnet-4", 20, "b"), &EventContext::new("p", "b"), now);

    let projects = engine.projects();
    assert_eq!(window::select(&projects, now), Some(at(14, 0)));

    let overridden = Snapshot::with_window(&projects, now, engine.block_duration(), Some(at(19, 0)));
    assert_eq!(overridden.unified_window_start(), Some(at(19, 0)));
    // Only the 15:00 block reaches past 19:00.
    assert_eq!(overridden.windowed_tokens(), 20.0);
}
