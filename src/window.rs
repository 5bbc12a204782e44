//! Unified Window Selector
//!
//! Picks the single current accounting window across every session of every
//! project. Among active, non-gap blocks, the earliest start of those that
//! contain `now` wins; if none contains `now`, the earliest start of all
//! active blocks. Preferring the oldest still-active window keeps the
//! reported window from jumping forward each time another session opens a
//! block at a later hour.

use crate::models::{Block, ProjectMap};
use chrono::{DateTime, Utc};

/// Every active, non-gap block across all projects and sessions.
pub fn active_blocks<'a>(
    projects: &'a ProjectMap,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a Block> + 'a {
    projects
        .values()
        .flat_map(|p| p.sessions.values())
        .flat_map(|s| s.blocks.iter())
        .filter(move |b| b.is_active(now))
}

pub fn select(projects: &ProjectMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut earliest_active: Option<DateTime<Utc>> = None;
    let mut earliest_containing: Option<DateTime<Utc>> = None;

    for block in active_blocks(projects, now) {
        earliest_active = Some(earliest_active.map_or(block.start, |s| s.min(block.start)));
        if block.contains(now) {
            earliest_containing = Some(earliest_containing.map_or(block.start, |s| s.min(block.start)));
        }
    }

    let selected = earliest_containing.or(earliest_active);
    tracing::trace!(
        now = %now,
        selected = ?selected,
        straddles_now = earliest_containing.is_some(),
        "Selected unified window"
    );
    selected
}
