//! Checkpoint and restore for engine state.
//!
//! A [`Checkpoint`] is an immutable snapshot of every live item (with its
//! tier, compression level and importance), the task state, and the
//! entanglement graph as a plain edge list. Checkpoints live in a bounded
//! in-memory ring ([`Checkpointer`]) and can be persisted as JSON through
//! [`CheckpointStore`].
//!
//! Snapshots contain no pointers or maps keyed by item id, so they
//! serialize as-is and diff cleanly.

use crate::context::entanglement::GraphSnapshot;
use crate::error::EngineError;
use crate::item::{ContextItem, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ckpt-{}", self.0)
    }
}

/// Full engine state at one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub step: u64,
    /// Next item id to hand out.
    pub next_item_id: u64,
    pub goal: String,
    /// Live items, ordered by id.
    pub items: Vec<ContextItem>,
    pub task_state: TaskState,
    pub graph: GraphSnapshot,
    /// Items retired into the task state digest so far.
    pub digested: usize,
}

/// Serializable checkpoint of engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    /// Step at capture time.
    pub step: u64,
    /// Wall-clock capture time, RFC 3339.
    pub taken_at: String,
    pub snapshot: EngineSnapshot,
}

// ── In-memory ring ─────────────────────────────────────────────────

/// Bounded ring of checkpoints; the oldest is dropped past `max_retained`.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    ring: VecDeque<Checkpoint>,
    max_retained: usize,
    every_n_steps: u64,
    next_id: u64,
    last_taken_step: Option<u64>,
}

impl Checkpointer {
    pub fn new(max_retained: usize, every_n_steps: u64) -> Self {
        Self {
            ring: VecDeque::new(),
            max_retained: max_retained.max(1),
            every_n_steps,
            next_id: 1,
            last_taken_step: None,
        }
    }

    /// Store a snapshot and return its id.
    pub fn capture(&mut self, snapshot: EngineSnapshot) -> CheckpointId {
        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        self.last_taken_step = Some(snapshot.step);
        self.ring.push_back(Checkpoint {
            id,
            step: snapshot.step,
            taken_at: chrono::Utc::now().to_rfc3339(),
            snapshot,
        });
        while self.ring.len() > self.max_retained {
            self.ring.pop_front();
        }
        id
    }

    /// Whether an automatic checkpoint is due at `step`.
    pub fn due(&self, step: u64) -> bool {
        if self.every_n_steps == 0 {
            return false;
        }
        let since = step.saturating_sub(self.last_taken_step.unwrap_or(0));
        since >= self.every_n_steps
    }

    /// Measure the automatic interval from `step` again, as after a restore
    /// to an earlier point.
    pub fn rewind_to(&mut self, step: u64) {
        self.last_taken_step = Some(step);
    }

    pub fn get(&self, id: CheckpointId) -> Option<&Checkpoint> {
        self.ring.iter().find(|c| c.id == id)
    }

    /// Most recent checkpoint taken at or before `step`.
    pub fn latest_at_or_before(&self, step: u64) -> Option<&Checkpoint> {
        self.ring
            .iter()
            .filter(|c| c.step <= step)
            .max_by_key(|c| (c.step, c.id))
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.ring.back()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CheckpointId> + '_ {
        self.ring.iter().map(|c| c.id)
    }

    /// Take ownership of an externally loaded checkpoint (e.g. from disk).
    pub fn adopt(&mut self, checkpoint: Checkpoint) {
        self.next_id = self.next_id.max(checkpoint.id.0 + 1);
        self.last_taken_step = Some(checkpoint.step);
        self.ring.push_back(checkpoint);
        while self.ring.len() > self.max_retained {
            self.ring.pop_front();
        }
    }
}

// ── On-disk store ──────────────────────────────────────────────────

/// Directory of persisted checkpoints.
///
/// Layout:
/// ```text
/// dir/
///   checkpoint-0001.json
///   checkpoint-0004.json
/// ```
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open a store, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn filename(id: CheckpointId) -> String {
        format!("checkpoint-{:04}.json", id.0)
    }

    pub fn path_for(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(Self::filename(id))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, EngineError> {
        let final_path = self.path_for(checkpoint.id);
        let tmp_path = self
            .dir
            .join(format!(".{}.tmp", Self::filename(checkpoint.id)));
        let json = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    /// Load a checkpoint file.
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint, EngineError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn load_id(&self, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(EngineError::UnknownCheckpoint(id));
        }
        Self::load(path)
    }

    /// Ids of stored checkpoints, ascending.
    pub fn list(&self) -> Result<Vec<CheckpointId>, EngineError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = name
                .strip_prefix("checkpoint-")
                .and_then(|s| s.strip_suffix(".json"))
            {
                match num.parse::<u64>() {
                    Ok(n) => ids.push(CheckpointId(n)),
                    Err(_) => warn!("Skipping unrecognized checkpoint file {name}"),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load the checkpoint with the highest id, if any.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>, EngineError> {
        match self.list()?.last() {
            Some(id) => self.load_id(*id).map(Some),
            None => Ok(None),
        }
    }
}
