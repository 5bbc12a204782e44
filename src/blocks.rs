//! Block Builder
//!
//! Folds validated, non-duplicate events into a session's ordered block list.
//! This is the only code that mutates blocks.
//!
//! For an event at `t` with `candidate = floor_to_hour(t)`:
//!
//! - an empty session starts a block at `candidate`
//! - more than one block duration since the last block's `last_activity`
//!   starts a new block at `candidate`
//! - `t` at or past the last block's `start + duration` also starts a new
//!   block at `candidate`
//! - otherwise the event is folded into the last block
//!
//! Whenever a new block would not be contiguous with the previous one, a
//! single gap block covering `[previous.end, candidate)` is inserted first.
//! Events older than the last block's start are folded into the block that
//! contains them, or rejected when none does.

use crate::error::{EngineError, EngineResult, Rejection};
use crate::models::{Block, Session, UsageEvent, BLOCK_DURATION_HOURS};
use crate::pricing::ModelWeights;
use crate::timestamp_parser::floor_to_hour;
use chrono::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Folded into the session's current last block.
    Extended,
    /// Started the session's first or a contiguous new block.
    NewBlock,
    /// Inserted a gap block, then started a new block.
    NewBlockAfterGap,
    /// Folded into an earlier block that contains the event.
    Backfilled,
}

pub struct BlockBuilder {
    duration: Duration,
    weights: ModelWeights,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new(Duration::hours(BLOCK_DURATION_HOURS), ModelWeights::default())
    }
}

impl BlockBuilder {
    pub fn new(duration: Duration, weights: ModelWeights) -> Self {
        Self { duration, weights }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn fold(&self, session: &mut Session, event: &UsageEvent) -> EngineResult<FoldOutcome> {
        let candidate_start = floor_to_hour(event.timestamp);

        let Some(last) = session.blocks.last_mut() else {
            session.blocks.push(self.open_block(candidate_start, event));
            return Ok(FoldOutcome::NewBlock);
        };

        if event.timestamp < last.start {
            return self.backfill(session, event);
        }

        let idle = event.timestamp - last.last_activity;
        let expired = event.timestamp >= last.start + self.duration;

        if idle > self.duration || expired {
            let previous_end = last.end;
            let outcome = if candidate_start > previous_end {
                session.blocks.push(Block::gap(previous_end, candidate_start));
                FoldOutcome::NewBlockAfterGap
            } else {
                FoldOutcome::NewBlock
            };
            session.blocks.push(self.open_block(candidate_start, event));
            return Ok(outcome);
        }

        self.fold_into(last, event);
        Ok(FoldOutcome::Extended)
    }

    fn open_block(&self, start: chrono::DateTime<chrono::Utc>, event: &UsageEvent) -> Block {
        let mut block = Block::new(start, self.duration, event.timestamp);
        self.fold_into(&mut block, event);
        block
    }

    fn backfill(&self, session: &mut Session, event: &UsageEvent) -> EngineResult<FoldOutcome> {
        match session
            .blocks
            .iter_mut()
            .rev()
            .find(|b| !b.is_gap && b.contains(event.timestamp))
        {
            Some(block) => {
                self.fold_into(block, event);
                Ok(FoldOutcome::Backfilled)
            }
            None => Err(EngineError::Validation(Rejection::OutOfOrder)),
        }
    }

    fn fold_into(&self, block: &mut Block, event: &UsageEvent) {
        let weighted = event.tokens.total() as f64 * self.weights.for_family(event.family);
        *block.model_tokens.entry(event.family).or_insert(0.0) += weighted;
        let family_messages = block.model_message_counts.entry(event.family).or_insert(0);
        *family_messages = family_messages.saturating_add(1);

        let model_key = if event.model_name.trim().is_empty() {
            "unknown".to_string()
        } else {
            event.model_name.clone()
        };
        block.raw_tokens.entry(model_key).or_default().add(&event.tokens);

        for tool in &event.tool_names {
            let count = block.tool_counts.entry(tool.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }

        block.message_count = block.message_count.saturating_add(1);
        if event.was_interrupted {
            block.interrupted_count = block.interrupted_count.saturating_add(1);
        }
        if event.timestamp > block.last_activity {
            block.last_activity = event.timestamp;
        }
        if event.timestamp < block.first_activity {
            block.first_activity = event.timestamp;
        }
        if let Some(cost) = event.native_cost {
            block.native_cost_total = Some(block.native_cost_total.unwrap_or(0.0) + cost);
            block.native_cost_count = block.native_cost_count.saturating_add(1);
        }
    }
}
