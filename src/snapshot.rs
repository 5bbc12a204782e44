//! Snapshot Aggregator
//!
//! Read-only view over the live project map at one instant. Every aggregate
//! is recomputed from the blocks on each call; nothing is cached here.
//!
//! The windowed block set is every active, non-gap block whose `[start, end)`
//! overlaps `[window_start, window_start + duration)`. With no window (idle)
//! all aggregates are zero or empty.

use crate::cost::{AttributedCost, CostAttributor};
use crate::models::{Block, CostSource, ModelFamily, ProjectMap};
use crate::pricing::ModelCostTable;
use crate::window;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A block together with the ids of the stream it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct WindowedBlock<'a> {
    pub project_id: &'a str,
    pub session_id: &'a str,
    pub block: &'a Block,
}

pub struct Snapshot<'a> {
    projects: &'a ProjectMap,
    as_of: DateTime<Utc>,
    window_start: Option<DateTime<Utc>>,
    window_duration: Duration,
}

impl<'a> Snapshot<'a> {
    pub fn new(projects: &'a ProjectMap, as_of: DateTime<Utc>, window_duration: Duration) -> Self {
        Self {
            projects,
            as_of,
            window_start: window::select(projects, as_of),
            window_duration,
        }
    }

    /// Use `window_start` verbatim instead of running the selector.
    pub fn with_window(
        projects: &'a ProjectMap,
        as_of: DateTime<Utc>,
        window_duration: Duration,
        window_start: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            projects,
            as_of,
            window_start,
            window_duration,
        }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn unified_window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    pub fn unified_window_end(&self) -> Option<DateTime<Utc>> {
        self.window_start.map(|s| s + self.window_duration)
    }

    pub fn windowed_blocks(&self) -> Vec<WindowedBlock<'a>> {
        let (Some(start), Some(end)) = (self.unified_window_start(), self.unified_window_end()) else {
            return Vec::new();
        };
        let as_of = self.as_of;

        self.projects
            .iter()
            .flat_map(|(project_id, project)| {
                project.sessions.iter().flat_map(move |(session_id, session)| {
                    session.blocks.iter().map(move |block| WindowedBlock {
                        project_id: project_id.as_str(),
                        session_id: session_id.as_str(),
                        block,
                    })
                })
            })
            .filter(|wb| wb.block.is_active(as_of) && wb.block.overlaps(start, end))
            .collect()
    }

    pub fn windowed_tokens(&self) -> f64 {
        self.windowed_blocks()
            .iter()
            .map(|wb| wb.block.total_weighted_tokens())
            .sum()
    }

    pub fn windowed_tokens_by_model(&self) -> BTreeMap<ModelFamily, f64> {
        let mut by_model = BTreeMap::new();
        for wb in self.windowed_blocks() {
            for (family, tokens) in &wb.block.model_tokens {
                *by_model.entry(*family).or_insert(0.0) += tokens;
            }
        }
        by_model
    }

    pub fn windowed_cost(&self, attributor: &CostAttributor, table: Option<&ModelCostTable>) -> f64 {
        self.windowed_blocks()
            .iter()
            .map(|wb| attributor.attribute(wb.block, table).amount)
            .sum()
    }

    pub fn active_project_count(&self) -> usize {
        self.windowed_blocks()
            .iter()
            .map(|wb| wb.project_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn active_session_count(&self) -> usize {
        self.windowed_blocks()
            .iter()
            .map(|wb| (wb.project_id, wb.session_id))
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        self.windowed_blocks().iter().map(|wb| wb.block.last_activity).max()
    }

    /// Everything above in one owned, serialisable value.
    pub fn report(&self, attributor: &CostAttributor, table: Option<&ModelCostTable>) -> SnapshotReport {
        let blocks = self.windowed_blocks();

        let mut cost = CostSummary::default();
        let mut tokens_by_model = BTreeMap::new();
        let mut tool_counts = BTreeMap::new();
        let mut projects = BTreeSet::new();
        let mut sessions = BTreeSet::new();
        let mut details = Vec::with_capacity(blocks.len());
        let mut message_count: u32 = 0;
        let mut interrupted_count: u32 = 0;
        let mut burn_rate = 0.0;

        for wb in &blocks {
            let attributed = attributor.attribute(wb.block, table);
            cost.record(&attributed);

            for (family, tokens) in &wb.block.model_tokens {
                *tokens_by_model.entry(*family).or_insert(0.0) += tokens;
            }
            for (tool, count) in &wb.block.tool_counts {
                let total: &mut u32 = tool_counts.entry(tool.clone()).or_insert(0);
                *total = total.saturating_add(*count);
            }
            message_count = message_count.saturating_add(wb.block.message_count);
            interrupted_count = interrupted_count.saturating_add(wb.block.interrupted_count);
            burn_rate += wb.block.burn_rate(self.as_of);
            projects.insert(wb.project_id);
            sessions.insert((wb.project_id, wb.session_id));
            details.push(BlockDetail::new(wb.project_id, wb.session_id, wb.block, attributed));
        }

        details.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.session_id.cmp(&b.session_id)));

        SnapshotReport {
            as_of: self.as_of,
            window_start: self.unified_window_start(),
            window_end: self.unified_window_end(),
            windowed_tokens: tokens_by_model.values().sum(),
            tokens_by_model,
            cost,
            active_projects: projects.len(),
            active_sessions: sessions.len(),
            message_count,
            interrupted_count,
            tool_counts,
            burn_rate,
            latest_activity: blocks.iter().map(|wb| wb.block.last_activity).max(),
            blocks: details,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total: f64,
    pub native: f64,
    pub computed: f64,
    #[serde(rename = "unpricedBlocks")]
    pub unpriced_blocks: usize,
}

impl CostSummary {
    fn record(&mut self, cost: &AttributedCost) {
        self.total += cost.amount;
        match cost.source {
            CostSource::Native => self.native += cost.amount,
            CostSource::Computed => self.computed += cost.amount,
            CostSource::Unpriced => self.unpriced_blocks += 1,
        }
    }
}

/// Per-block listing/export row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDetail {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(rename = "isGap")]
    pub is_gap: bool,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
    #[serde(rename = "modelTokens")]
    pub model_tokens: BTreeMap<ModelFamily, f64>,
    #[serde(rename = "toolCounts")]
    pub tool_counts: BTreeMap<String, u32>,
    #[serde(rename = "messageCount")]
    pub message_count: u32,
    #[serde(rename = "activityMinutes")]
    pub activity_minutes: f64,
    pub cost: f64,
    #[serde(rename = "costSource")]
    pub cost_source: CostSource,
}

impl BlockDetail {
    pub fn new(project_id: &str, session_id: &str, block: &Block, cost: AttributedCost) -> Self {
        Self {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            start: block.start,
            end: block.end,
            is_gap: block.is_gap,
            last_activity: block.last_activity,
            model_tokens: block.model_tokens.clone(),
            tool_counts: block.tool_counts.clone(),
            message_count: block.message_count,
            activity_minutes: block.activity_minutes(),
            cost: cost.amount,
            cost_source: cost.source,
        }
    }

    pub fn total_tokens(&self) -> f64 {
        self.model_tokens.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotReport {
    #[serde(rename = "asOf")]
    pub as_of: DateTime<Utc>,
    #[serde(rename = "windowStart")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(rename = "windowEnd")]
    pub window_end: Option<DateTime<Utc>>,
    #[serde(rename = "windowedTokens")]
    pub windowed_tokens: f64,
    #[serde(rename = "tokensByModel")]
    pub tokens_by_model: BTreeMap<ModelFamily, f64>,
    pub cost: CostSummary,
    #[serde(rename = "activeProjects")]
    pub active_projects: usize,
    #[serde(rename = "activeSessions")]
    pub active_sessions: usize,
    #[serde(rename = "messageCount")]
    pub message_count: u32,
    #[serde(rename = "interruptedCount")]
    pub interrupted_count: u32,
    #[serde(rename = "toolCounts")]
    pub tool_counts: BTreeMap<String, u32>,
    /// Weighted tokens per minute, summed over the windowed blocks.
    #[serde(rename = "burnRate")]
    pub burn_rate: f64,
    #[serde(rename = "latestActivity")]
    pub latest_activity: Option<DateTime<Utc>>,
    pub blocks: Vec<BlockDetail>,
}

impl SnapshotReport {
    pub fn is_idle(&self) -> bool {
        self.window_start.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::NativeCostBounds;
    use crate::litellm_pricing::PricingManager;
    use crate::models::{Project, Session};
    use crate::pricing::ModelWeights;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 9, h, m, 0).unwrap()
    }

    fn block(start: DateTime<Utc>, last: DateTime<Utc>, family: ModelFamily, tokens: f64) -> Block {
        let mut b = Block::new(start, Duration::hours(5), start);
        b.last_activity = last;
        b.model_tokens.insert(family, tokens);
        b.message_count = 1;
        b.native_cost_total = Some(tokens / 1000.0);
        b.native_cost_count = 1;
        b
    }

    fn projects(entries: Vec<(&str, &str, Block)>) -> ProjectMap {
        let mut map = ProjectMap::new();
        for (p, s, b) in entries {
            map.entry(p.to_string())
                .or_insert_with(|| Project::new(p.to_string()))
                .sessions
                .entry(s.to_string())
                .or_insert_with(|| Session::new(s.to_string(), p.to_string()))
                .blocks
                .push(b);
        }
        map
    }

    fn attributor() -> CostAttributor {
        CostAttributor::new(
            Arc::new(PricingManager::builtin(ModelWeights::default())),
            NativeCostBounds::default(),
        )
    }

    #[test]
    fn test_aggregates_over_overlapping_active_blocks() {
        let map = projects(vec![
            ("p1", "a", block(at(14, 0), at(15, 20), ModelFamily::Sonnet, 1000.0)),
            ("p1", "b", block(at(15, 0), at(15, 25), ModelFamily::Opus, 5000.0)),
            ("p2", "c", block(at(12, 0), at(15, 10), ModelFamily::Sonnet, 2000.0)),
            // Ended long ago, never counted.
            ("p3", "d", block(at(1, 0), at(2, 0), ModelFamily::Haiku, 9999.0)),
        ]);
        let snapshot = Snapshot::new(&map, at(15, 30), Duration::hours(5));

        assert_eq!(snapshot.unified_window_start(), Some(at(12, 0)));
        assert_eq!(snapshot.unified_window_end(), Some(at(17, 0)));
        assert_eq!(snapshot.windowed_tokens(), 8000.0);
        assert_eq!(snapshot.windowed_tokens_by_model()[&ModelFamily::Opus], 5000.0);
        assert_eq!(snapshot.active_project_count(), 2);
        assert_eq!(snapshot.active_session_count(), 3);
        assert!((snapshot.windowed_cost(&attributor(), None) - 8.0).abs() < 1e-9);
        assert_eq!(snapshot.latest_activity(), Some(at(15, 25)));
    }

    #[test]
    fn test_idle_snapshot_is_all_zero() {
        let map = projects(vec![("p", "s", block(at(1, 0), at(2, 0), ModelFamily::Sonnet, 100.0))]);
        let snapshot = Snapshot::new(&map, at(15, 30), Duration::hours(5));

        assert_eq!(snapshot.unified_window_start(), None);
        assert_eq!(snapshot.windowed_tokens(), 0.0);
        assert!(snapshot.windowed_tokens_by_model().is_empty());
        assert_eq!(snapshot.windowed_cost(&attributor(), None), 0.0);
        assert_eq!(snapshot.active_project_count(), 0);
        assert_eq!(snapshot.active_session_count(), 0);

        let report = snapshot.report(&attributor(), None);
        assert!(report.is_idle());
        assert!(report.blocks.is_empty());
    }

    #[test]
    fn test_manual_window_used_verbatim() {
        let map = projects(vec![
            ("p", "a", block(at(11, 0), at(15, 0), ModelFamily::Sonnet, 100.0)),
            ("p", "b", block(at(15, 0), at(15, 10), ModelFamily::Sonnet, 200.0)),
        ]);
        let snapshot = Snapshot::with_window(&map, at(15, 30), Duration::hours(5), Some(at(16, 0)));

        assert_eq!(snapshot.unified_window_start(), Some(at(16, 0)));
        // Only the 15:00 block reaches into [16:00, 21:00).
        assert_eq!(snapshot.windowed_tokens(), 200.0);
    }

    #[test]
    fn test_report_matches_individual_queries() {
        let mut tooled = block(at(14, 0), at(15, 20), ModelFamily::Sonnet, 1000.0);
        tooled.tool_counts.insert("Read".to_string(), 3);
        let map = projects(vec![
            ("p1", "a", tooled),
            ("p2", "b", block(at(15, 0), at(15, 25), ModelFamily::Opus, 5000.0)),
        ]);
        let snapshot = Snapshot::new(&map, at(15, 30), Duration::hours(5));
        let report = snapshot.report(&attributor(), None);

        assert_eq!(report.windowed_tokens, snapshot.windowed_tokens());
        assert_eq!(report.active_sessions, 2);
        assert_eq!(report.cost.computed, 0.0);
        assert!((report.cost.native - 6.0).abs() < 1e-9);
        assert_eq!(report.tool_counts["Read"], 3);
        assert_eq!(report.blocks.len(), 2);
        assert_eq!(report.blocks[0].start, at(14, 0));
        assert_eq!(report.blocks[0].cost_source, CostSource::Native);
        assert_eq!(report.blocks[0].activity_minutes, 80.0);
        // 1000 over 90 minutes plus 5000 over 30 minutes.
        assert!((report.burn_rate - (1000.0 / 90.0 + 5000.0 / 30.0)).abs() < 1e-9);
    }
}
