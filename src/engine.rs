//! Engine context
//!
//! [`UsageEngine`] owns everything the pipeline mutates: the project map,
//! the dedup registry and the ingest counters, all behind one mutex. Ingest
//! is synchronous. Snapshots copy the windowed blocks out under the lock and
//! only then await pricing, so no lock is ever held across a suspension
//! point.
//!
//! ```text
//! raw record -> EventParser -> DedupRegistry -> BlockBuilder -> ProjectMap
//!                                                                   |
//!                       SnapshotReport <- Snapshot <- window::select
//! ```

use crate::blocks::{BlockBuilder, FoldOutcome};
use crate::cache::PersistedCache;
use crate::cost::{CostAttributor, NativeCostBounds};
use crate::dedup::DedupRegistry;
use crate::error::EngineError;
use crate::litellm_pricing::PricingManager;
use crate::models::{Block, Project, ProjectMap, Session, BLOCK_DURATION_HOURS};
use crate::parser::{ClockBounds, EventContext, EventParser};
use crate::pricing::ModelWeights;
use crate::snapshot::{BlockDetail, Snapshot, SnapshotReport};
use crate::window;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the engine needs to know, passed in explicitly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub block_duration: Duration,
    pub weights: ModelWeights,
    pub max_future_skew: Option<Duration>,
    pub max_event_age: Option<Duration>,
    pub native_cost_bounds: NativeCostBounds,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            block_duration: Duration::hours(BLOCK_DURATION_HOURS),
            weights: ModelWeights::default(),
            max_future_skew: None,
            max_event_age: None,
            native_cost_bounds: NativeCostBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub folded: u64,
    pub duplicates: u64,
    pub parse_errors: u64,
    pub validation_errors: u64,
}

impl IngestStats {
    pub fn rejected(&self) -> u64 {
        self.parse_errors + self.validation_errors
    }

    /// Counts accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &IngestStats) -> IngestStats {
        IngestStats {
            folded: self.folded - earlier.folded,
            duplicates: self.duplicates - earlier.duplicates,
            parse_errors: self.parse_errors - earlier.parse_errors,
            validation_errors: self.validation_errors - earlier.validation_errors,
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Folded(FoldOutcome),
    Duplicate,
    Rejected,
}

struct EngineState {
    projects: ProjectMap,
    dedup: DedupRegistry,
    stats: IngestStats,
}

pub struct UsageEngine {
    run_id: Uuid,
    parser: EventParser,
    builder: BlockBuilder,
    attributor: CostAttributor,
    state: Mutex<EngineState>,
}

impl UsageEngine {
    pub fn new(settings: EngineSettings, pricing: Arc<PricingManager>) -> Self {
        Self::with_dedup(settings, pricing, DedupRegistry::new())
    }

    /// Start from a previous run's persisted dedup keys and recent blocks.
    pub fn from_cache(settings: EngineSettings, pricing: Arc<PricingManager>, cache: &PersistedCache) -> Self {
        let dedup = DedupRegistry::from_keys(cache.dedup_keys.iter().cloned());
        let engine = Self::with_dedup(settings, pricing, dedup);
        {
            let mut state = engine.lock_state();
            for session in &cache.sessions {
                state
                    .projects
                    .entry(session.project_id.clone())
                    .or_insert_with(|| Project::new(session.project_id.clone()))
                    .sessions
                    .insert(session.session_id.clone(), session.clone());
            }
        }
        info!(sessions = cache.sessions.len(), "Restored recent blocks");
        engine
    }

    fn with_dedup(settings: EngineSettings, pricing: Arc<PricingManager>, dedup: DedupRegistry) -> Self {
        let run_id = Uuid::new_v4();
        let bounds = ClockBounds {
            now: None,
            max_future_skew: settings.max_future_skew,
            max_age: settings.max_event_age,
        };

        info!(
            run_id = %run_id,
            block_hours = settings.block_duration.num_hours(),
            pricing_source = pricing.source_name(),
            known_keys = dedup.unique_messages(),
            "Usage engine created"
        );

        Self {
            run_id,
            parser: EventParser::new(bounds),
            builder: BlockBuilder::new(settings.block_duration, settings.weights),
            attributor: CostAttributor::new(pricing, settings.native_cost_bounds),
            state: Mutex::new(EngineState {
                projects: ProjectMap::new(),
                dedup,
                stats: IngestStats::default(),
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn block_duration(&self) -> Duration {
        self.builder.duration()
    }

    pub fn attributor(&self) -> &CostAttributor {
        &self.attributor
    }

    /// Parse, deduplicate and fold one raw record. Bad records are counted
    /// and logged, never returned as errors.
    pub fn ingest(&self, record: &Value, ctx: &EventContext, now: DateTime<Utc>) -> IngestOutcome {
        let parser = self.parser.with_now(now);
        let mut state = self.lock_state();

        let event = match parser.parse(record, ctx) {
            Ok(event) => event,
            Err(e) => {
                state.count_rejection(&e);
                debug!(project = %ctx.project_id, session = %ctx.session_id, error = %e, "Skipped record");
                return IngestOutcome::Rejected;
            }
        };

        if state.dedup.is_duplicate(&event) {
            state.stats.duplicates += 1;
            debug!(
                message_id = ?event.message_id,
                request_id = ?event.request_id,
                "Skipped duplicate event"
            );
            return IngestOutcome::Duplicate;
        }

        let session = state
            .projects
            .entry(event.project_id.clone())
            .or_insert_with(|| Project::new(event.project_id.clone()))
            .session_mut(&event.session_id);

        match self.builder.fold(session, &event) {
            Ok(outcome) => {
                state.stats.folded += 1;
                debug!(
                    project = %event.project_id,
                    session = %event.session_id,
                    family = %event.family,
                    tokens = event.tokens.total(),
                    outcome = ?outcome,
                    "Folded event"
                );
                IngestOutcome::Folded(outcome)
            }
            Err(e) => {
                warn!(
                    project = %event.project_id,
                    session = %event.session_id,
                    timestamp = %event.timestamp,
                    error = %e,
                    "Rejected event"
                );
                state.count_rejection(&e);
                IngestOutcome::Rejected
            }
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.lock_state().stats
    }

    pub fn unique_messages(&self) -> usize {
        self.lock_state().dedup.unique_messages()
    }

    pub fn unified_window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        window::select(&self.lock_state().projects, now)
    }

    /// Full query at `now`. `window_override` replaces the selected window
    /// start verbatim.
    pub async fn snapshot(&self, now: DateTime<Utc>, window_override: Option<DateTime<Utc>>) -> SnapshotReport {
        let duration = self.builder.duration();
        let (window_start, windowed) = {
            let state = self.lock_state();
            let window_start = window_override.or_else(|| window::select(&state.projects, now));
            let snapshot = Snapshot::with_window(&state.projects, now, duration, window_start);

            let mut windowed = ProjectMap::new();
            for wb in snapshot.windowed_blocks() {
                windowed
                    .entry(wb.project_id.to_string())
                    .or_insert_with(|| Project::new(wb.project_id.to_string()))
                    .session_mut(wb.session_id)
                    .blocks
                    .push(wb.block.clone());
            }
            (window_start, windowed)
        };

        let table = self.attributor.pricing_table().await;
        Snapshot::with_window(&windowed, now, duration, window_start).report(&self.attributor, table.as_deref())
    }

    /// Every block of every session, gaps included, in start order.
    pub async fn blocks(&self, project: Option<&str>) -> Vec<BlockDetail> {
        let projects = {
            let state = self.lock_state();
            match project {
                Some(id) => state
                    .projects
                    .get(id)
                    .map(|p| BTreeMap::from([(id.to_string(), p.clone())]))
                    .unwrap_or_default(),
                None => state.projects.clone(),
            }
        };

        let table = self.attributor.pricing_table().await;
        let mut details: Vec<BlockDetail> = projects
            .values()
            .flat_map(|p| p.sessions.values())
            .flat_map(|s| {
                s.blocks.iter().map(|b| {
                    let cost = self.attributor.attribute(b, table.as_deref());
                    BlockDetail::new(&s.project_id, &s.session_id, b, cost)
                })
            })
            .collect();
        details.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.session_id.cmp(&b.session_id)));
        details
    }

    /// Copy of the project map for callers that want to run their own
    /// [`Snapshot`] queries.
    pub fn projects(&self) -> ProjectMap {
        self.lock_state().projects.clone()
    }

    /// Persistable state at `now`: dedup keys, the caller's read offsets and
    /// every block that ends within one block duration of `now`. Each
    /// session's last block is always kept so folding resumes correctly.
    pub fn checkpoint(&self, tailer_positions: BTreeMap<String, u64>, now: DateTime<Utc>) -> PersistedCache {
        let cutoff = now - self.builder.duration();
        let state = self.lock_state();
        let sessions = state
            .projects
            .values()
            .flat_map(|p| p.sessions.values())
            .filter_map(|s| recent_blocks(s, cutoff))
            .collect();

        PersistedCache {
            dedup_keys: state.dedup.export_keys(),
            tailer_positions,
            sessions,
            ..PersistedCache::default()
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        // Every mutation leaves the state consistent before it can panic.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The trailing blocks of `session` that end after `cutoff`, without a
/// leading gap. `None` for an empty session.
fn recent_blocks(session: &Session, cutoff: DateTime<Utc>) -> Option<Session> {
    let last = session.blocks.len().checked_sub(1)?;
    let first = session
        .blocks
        .iter()
        .position(|b| b.end > cutoff)
        .unwrap_or(last);
    let blocks: Vec<Block> = session.blocks[first..]
        .iter()
        .skip_while(|b| b.is_gap)
        .cloned()
        .collect();

    Some(Session {
        blocks,
        ..Session::new(session.session_id.clone(), session.project_id.clone())
    })
}

impl EngineState {
    fn count_rejection(&mut self, error: &EngineError) {
        if error.is_parse() {
            self.stats.parse_errors += 1;
        } else {
            self.stats.validation_errors += 1;
        }
    }
}
