//! Raw record sources
//!
//! The engine only sees decoded JSON values tagged with a project and a
//! session. [`JsonlDirectorySource`] produces them from a tree of session
//! logs laid out as `<projects_dir>/<project>/<session>.jsonl`, remembering
//! how many bytes of each file it has already consumed.

use crate::parser::EventContext;
use anyhow::{Context, Result};
use glob::glob;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{metadata, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RawRecord {
    pub context: EventContext,
    pub value: Value,
}

pub trait RecordSource {
    /// Everything appended since the previous poll.
    fn poll(&mut self) -> Result<Vec<RawRecord>>;

    /// Read offsets to persist, keyed by source path.
    fn positions(&self) -> BTreeMap<String, u64>;
}

/// What one file yielded in a poll.
struct FileChunk {
    key: String,
    offset: u64,
    records: Vec<RawRecord>,
    malformed: usize,
}

pub struct JsonlDirectorySource {
    projects_dir: PathBuf,
    positions: BTreeMap<String, u64>,
    malformed_lines: usize,
}

impl JsonlDirectorySource {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self::with_positions(projects_dir, BTreeMap::new())
    }

    /// Resume from offsets saved by an earlier run.
    pub fn with_positions(projects_dir: impl Into<PathBuf>, positions: BTreeMap<String, u64>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            positions,
            malformed_lines: 0,
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Lines that were not valid JSON, across all polls.
    pub fn malformed_lines(&self) -> usize {
        self.malformed_lines
    }

    /// Session logs under the projects directory, oldest modification first.
    pub fn find_jsonl_files(&self) -> Result<Vec<PathBuf>> {
        if !self.projects_dir.exists() {
            debug!(dir = %self.projects_dir.display(), "Projects directory does not exist yet");
            return Ok(Vec::new());
        }

        let pattern = self.projects_dir.join("*").join("*.jsonl");
        let mut files: Vec<PathBuf> = glob(&pattern.to_string_lossy())
            .context("Invalid projects directory pattern")?
            .flatten()
            .collect();

        files.sort_by_key(|path| {
            metadata(path)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        });
        Ok(files)
    }

    fn read_file(path: &Path, offset: u64) -> Result<FileChunk> {
        let key = path.to_string_lossy().into_owned();
        let context = context_for(path);

        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();
        // A shorter file was truncated or replaced; start over.
        let start = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(start))?;

        let mut reader = BufReader::new(file);
        let mut consumed = start;
        let mut records = Vec::new();
        let mut malformed = 0;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            // A missing newline means the writer is mid-line.
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            consumed += n as u64;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => records.push(RawRecord {
                    context: context.clone(),
                    value,
                }),
                Err(e) => {
                    malformed += 1;
                    debug!(file = %key, error = %e, "Skipping malformed line");
                }
            }
        }

        Ok(FileChunk {
            key,
            offset: consumed,
            records,
            malformed,
        })
    }

    fn read_all(&self, files: &[PathBuf]) -> Vec<Result<FileChunk>> {
        let offset_of = |path: &PathBuf| {
            self.positions
                .get(path.to_string_lossy().as_ref())
                .copied()
                .unwrap_or(0)
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            files
                .par_iter()
                .map(|path| Self::read_file(path, offset_of(path)))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            files
                .iter()
                .map(|path| Self::read_file(path, offset_of(path)))
                .collect()
        }
    }
}

impl RecordSource for JsonlDirectorySource {
    fn poll(&mut self) -> Result<Vec<RawRecord>> {
        let files = self.find_jsonl_files()?;
        let mut records = Vec::new();

        for chunk in self.read_all(&files) {
            match chunk {
                Ok(chunk) => {
                    if !chunk.records.is_empty() {
                        debug!(file = %chunk.key, records = chunk.records.len(), "Read new records");
                    }
                    self.malformed_lines += chunk.malformed;
                    self.positions.insert(chunk.key, chunk.offset);
                    records.extend(chunk.records);
                }
                // One unreadable file must not stall the rest.
                Err(e) => warn!(error = %e, "Failed to read session log"),
            }
        }

        Ok(records)
    }

    fn positions(&self) -> BTreeMap<String, u64> {
        self.positions.clone()
    }
}

/// Project is the parent directory name, session the file stem.
fn context_for(path: &Path) -> EventContext {
    let session_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let project_id = path
        .parent()
        .and_then(Path::file_name)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    EventContext::new(project_id, session_id)
}
