//! Live monitoring loop
//!
//! Each tick polls the [`RecordSource`] for appended records, ingests them,
//! takes a snapshot and redraws the terminal. The cache is checkpointed every
//! `checkpoint_every` ticks and once more on Ctrl+C.
//!
//! ```text
//! ============================================================
//! Usage Window
//! ============================================================
//!
//! 🕐 14:00 → 19:00  (3h 30m left)
//!
//! ⚡ Tokens:   12.5K
//! 💲 Cost:     $1.50  (native $1.50)
//! ```

use crate::display::DisplayManager;
use crate::engine::{IngestStats, UsageEngine};
use crate::file_discovery::RecordSource;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

pub struct LiveMonitor {
    engine: Arc<UsageEngine>,
    source: Box<dyn RecordSource + Send>,
    display: DisplayManager,
    cache_path: Option<PathBuf>,
    poll_interval: Duration,
    checkpoint_every: u32,
}

impl LiveMonitor {
    pub fn new(engine: Arc<UsageEngine>, source: Box<dyn RecordSource + Send>) -> Self {
        Self {
            engine,
            source,
            display: DisplayManager::new(),
            cache_path: None,
            poll_interval: Duration::from_secs(5),
            checkpoint_every: 12,
        }
    }

    pub fn with_cache(mut self, path: PathBuf) -> Self {
        self.cache_path = Some(path);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_checkpoint_every(mut self, ticks: u32) -> Self {
        self.checkpoint_every = ticks;
        self
    }

    pub fn engine(&self) -> &UsageEngine {
        &self.engine
    }

    /// Ingest everything the source has appended since the last poll.
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<IngestStats> {
        let records = self.source.poll()?;
        let before = self.engine.stats();
        for record in &records {
            self.engine.ingest(&record.value, &record.context, now);
        }
        let delta = self.engine.stats().since(&before);
        if !records.is_empty() {
            debug!(
                records = records.len(),
                folded = delta.folded,
                duplicates = delta.duplicates,
                rejected = delta.rejected(),
                "Poll complete"
            );
        }
        Ok(delta)
    }

    /// Persist dedup keys, read offsets and recent blocks, if a cache path
    /// is set.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        self.engine
            .checkpoint(self.source.positions(), Utc::now())
            .save(path)
    }

    /// Poll, render, repeat until Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        let mut interval = time::interval(self.poll_interval);
        let mut ticks: u32 = 0;

        self.hide_cursor();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    self.show_cursor();
                    println!("\n\nMonitoring stopped.");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.poll_once(now) {
                        warn!(error = %e, "Poll failed");
                    }

                    let report = self.engine.snapshot(now, None).await;
                    self.clear_screen();
                    print!("{}", self.display.render_snapshot(&report));
                    let _ = io::stdout().flush();

                    ticks = ticks.wrapping_add(1);
                    if self.checkpoint_every > 0 && ticks % self.checkpoint_every == 0 {
                        if let Err(e) = self.checkpoint() {
                            warn!(error = %e, "Checkpoint failed");
                        }
                    }
                }
            }
        }

        self.checkpoint()?;
        let stats = self.engine.stats();
        info!(
            folded = stats.folded,
            duplicates = stats.duplicates,
            rejected = stats.rejected(),
            "Monitor stopped"
        );
        Ok(())
    }

    fn clear_screen(&self) {
        print!("\x1b[2J\x1b[H");
    }

    fn hide_cursor(&self) {
        print!("\x1b[?25l");
        let _ = io::stdout().flush();
    }

    fn show_cursor(&self) {
        print!("\x1b[?25h");
        let _ = io::stdout().flush();
    }
}
