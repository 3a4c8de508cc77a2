//! Debounced checkpoint persistence.
//!
//! The whole of application state (personas, messages, facts, digests)
//! plus the queue's item list is serialized as one JSON snapshot. Writes
//! are atomic (temp file + fsync + rename) to prevent corruption on
//! crash. Saves are debounced: mutations mark the store dirty and the
//! scheduler's maintenance phase writes once the debounce interval has
//! elapsed, or immediately on an explicit flush.
//!
//! Snapshots are always taken by the loop task between awaits, so they
//! can never observe a half-applied mutation.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{KindredError, Result};
use crate::queue::{RequestQueue, WorkItem};
use crate::state::store::StateStore;
use crate::state::types::{DailyDigest, HumanFact, Message, Persona};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One serialized checkpoint: everything needed to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub personas: Vec<Persona>,
    pub messages: Vec<Message>,
    pub facts: Vec<HumanFact>,
    pub digests: Vec<DailyDigest>,
    /// Queue items with retry state intact, so backoff timers resume.
    pub queue: Vec<WorkItem>,
}

impl Snapshot {
    /// Capture the current state and queue.
    pub fn capture(state: &StateStore, queue: &RequestQueue) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            personas: state.export_personas(),
            messages: state.export_messages(),
            facts: state.export_facts(),
            digests: state.export_digests(),
            queue: queue.export_items(),
        }
    }
}

/// Debounce bookkeeping plus the snapshot file itself.
///
/// A `None` path disables persistence entirely (embedded and test use).
#[derive(Debug)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
    debounce: Duration,
    dirty: bool,
    last_save: Option<Instant>,
}

impl CheckpointStore {
    /// Create a store writing to `path`, or a no-op store for `None`.
    ///
    /// # Errors
    /// Returns [`KindredError::Checkpoint`] if the parent directory cannot
    /// be created.
    pub fn new(path: Option<PathBuf>, debounce: Duration) -> Result<Self> {
        if let Some(path) = &path
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                KindredError::Checkpoint(format!(
                    "failed to create checkpoint directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path,
            debounce,
            dirty: false,
            last_save: None,
        })
    }

    /// Record that state has changed since the last save.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True when a debounced save should run now.
    pub fn due(&self) -> bool {
        self.dirty
            && self
                .last_save
                .is_none_or(|at| at.elapsed() >= self.debounce)
    }

    /// Write a snapshot unconditionally, clearing the dirty flag.
    ///
    /// # Errors
    /// Returns [`KindredError::Checkpoint`] on serialization or I/O
    /// failure; the dirty flag is kept so the next tick retries.
    pub fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = self.path.clone() else {
            self.dirty = false;
            return Ok(());
        };
        write_snapshot_atomic(&path, snapshot)?;
        self.dirty = false;
        self.last_save = Some(Instant::now());
        debug!(path = %path.display(), items = snapshot.queue.len(), "checkpoint saved");
        Ok(())
    }

    /// Load the snapshot if one exists.
    ///
    /// An absent file is a clean first run (`None`). An unreadable or
    /// unparseable file is an error; silently discarding a corrupt
    /// checkpoint would lose the user's history.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KindredError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|e| {
            KindredError::Checkpoint(format!("failed to parse {}: {e}", path.display()))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(KindredError::Checkpoint(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Writes to a temp file in the same directory, fsyncs, then renames.
fn write_snapshot_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| KindredError::Checkpoint(format!("failed to serialize snapshot: {e}")))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("checkpoint.json");
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| {
        KindredError::Checkpoint(format!(
            "failed to write temp file {}: {e}",
            tmp_path.display()
        ))
    })?;

    // fsync the file
    match std::fs::File::open(&tmp_path) {
        Ok(file) => {
            let _ = file.sync_all();
        }
        Err(e) => warn!(error = %e, "could not reopen temp checkpoint for fsync"),
    }

    // Atomic rename
    std::fs::rename(&tmp_path, path).map_err(|e| {
        KindredError::Checkpoint(format!(
            "failed to rename temp file to {}: {e}",
            path.display()
        ))
    })?;

    Ok(())
}
