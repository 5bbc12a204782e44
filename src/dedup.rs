//! Deduplication Registry
//!
//! Suppresses usage events that were already counted. The upstream log source
//! delivers at least once (a restart replays bytes already read), so every
//! event is checked against a process-lifetime registry of composite
//! `(message_id, request_id)` keys before it is folded.
//!
//! ## Rules
//!
//! - The key is the `(message_id, request_id)` pair, compared field by
//!   field. If either half is absent the event cannot be deduplicated and is
//!   always folded.
//! - The first sighting of a key registers it; later sightings are duplicates.
//! - The registry is unbounded for the lifetime of the process. It is
//!   persisted through [`crate::cache`] and reloaded on start.
//!
//! The set is a `DashSet` so lookups can run through a shared reference.

use crate::models::UsageEvent;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Composite identity of one upstream message.
pub type DedupKey = (String, String);

pub struct DedupRegistry {
    processed_keys: DashSet<DedupKey>,
    duplicate_count: AtomicU64,
    undeduplicable_count: AtomicU64,
}

impl Default for DedupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self {
            processed_keys: DashSet::new(),
            duplicate_count: AtomicU64::new(0),
            undeduplicable_count: AtomicU64::new(0),
        }
    }

    /// Rebuild a registry from keys exported by a previous run.
    pub fn from_keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = DedupKey>,
    {
        let registry = Self::new();
        for key in keys {
            registry.processed_keys.insert(key);
        }
        registry
    }

    /// Composite identity key, or `None` when either id is missing.
    pub fn key_for(event: &UsageEvent) -> Option<DedupKey> {
        let message_id = event.message_id.clone()?;
        let request_id = event.request_id.clone()?;
        Some((message_id, request_id))
    }

    /// Returns true if this event was already counted. Registers the key on
    /// first sight.
    pub fn is_duplicate(&self, event: &UsageEvent) -> bool {
        let Some(key) = Self::key_for(event) else {
            self.undeduplicable_count.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if self.processed_keys.insert(key) {
            false
        } else {
            self.duplicate_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                message_id = ?event.message_id,
                request_id = ?event.request_id,
                "Skipping duplicate entry"
            );
            true
        }
    }

    pub fn contains(&self, message_id: &str, request_id: &str) -> bool {
        self.processed_keys
            .contains(&(message_id.to_string(), request_id.to_string()))
    }

    /// Number of distinct keys registered.
    pub fn unique_messages(&self) -> usize {
        self.processed_keys.len()
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count.load(Ordering::Relaxed)
    }

    pub fn undeduplicable_count(&self) -> u64 {
        self.undeduplicable_count.load(Ordering::Relaxed)
    }

    /// Sorted key list for the persisted cache.
    pub fn export_keys(&self) -> Vec<DedupKey> {
        let mut keys: Vec<DedupKey> = self.processed_keys.iter().map(|k| k.clone()).collect();
        keys.sort();
        keys
    }
}
