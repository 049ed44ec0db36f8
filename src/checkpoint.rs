use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::CHECKPOINT_FILE;

/// On-disk checkpoint, rewritten whole after every commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub processed_unit_ids: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
    /// Opaque per-source resume state, keyed by source name
    #[serde(default)]
    pub cursor_state: BTreeMap<String, Value>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            processed_unit_ids: BTreeSet::new(),
            last_updated: Utc::now(),
            cursor_state: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotStarted,
    InProgress,
    Committed,
}

pub fn checkpoint_path(output_dir: &Path) -> PathBuf {
    output_dir.join(CHECKPOINT_FILE)
}

/// Missing and corrupt files both load as `None`; re-processing is always safe
/// because persistence is idempotent.
pub fn load_if_valid(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint file: {}", path.display()))?;
    let reader = BufReader::new(file);

    match serde_json::from_reader::<_, Checkpoint>(reader) {
        Ok(cp) => {
            info!(
                units = cp.processed_unit_ids.len(),
                last_updated = %cp.last_updated,
                "Loaded checkpoint"
            );
            Ok(Some(cp))
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Checkpoint file is corrupt or unreadable");
            Ok(None)
        }
    }
}

pub fn clear(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove checkpoint file: {}", path.display()))?;
        info!("Checkpoint cleared");
    }
    Ok(())
}

/// Tracks committed units durably and in-flight units transiently.
///
/// In-progress state never reaches disk: a unit interrupted by a crash is
/// simply not committed and runs again from scratch on the next start.
pub struct CheckpointManager {
    path: PathBuf,
    state: Mutex<Checkpoint>,
    in_progress: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned guard still holds consistent data; every write is a whole-value swap
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CheckpointManager {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_if_valid(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            state: Mutex::new(state),
            in_progress: Mutex::new(HashSet::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_done(&self, unit_id: &str) -> bool {
        lock(&self.state).processed_unit_ids.contains(unit_id)
    }

    pub fn state(&self, unit_id: &str) -> UnitState {
        if self.is_done(unit_id) {
            UnitState::Committed
        } else if lock(&self.in_progress).contains(unit_id) {
            UnitState::InProgress
        } else {
            UnitState::NotStarted
        }
    }

    pub fn begin(&self, unit_id: &str) {
        lock(&self.in_progress).insert(unit_id.to_string());
    }

    /// Forgets an in-flight unit that failed; it stays eligible for the next run.
    pub fn abandon(&self, unit_id: &str) {
        lock(&self.in_progress).remove(unit_id);
    }

    /// Durably marks a unit done. Call only after its rows are flushed.
    pub fn commit(&self, unit_id: &str, cursor: Option<(&str, Value)>) -> Result<()> {
        let mut state = lock(&self.state);
        let mut next = state.clone();
        next.processed_unit_ids.insert(unit_id.to_string());
        if let Some((source, value)) = cursor {
            next.cursor_state.insert(source.to_string(), value);
        }
        next.last_updated = Utc::now();

        self.save(&next)?;
        *state = next;
        drop(state);

        lock(&self.in_progress).remove(unit_id);
        debug!(unit_id, "Checkpoint committed");
        Ok(())
    }

    pub fn cursor(&self, source_name: &str) -> Option<Value> {
        lock(&self.state).cursor_state.get(source_name).cloned()
    }

    pub fn processed_count(&self) -> usize {
        lock(&self.state).processed_unit_ids.len()
    }

    pub fn snapshot(&self) -> Checkpoint {
        lock(&self.state).clone()
    }

    /// Write-to-temp, fsync, rename.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let file = File::create(&tmp_path).with_context(|| {
            format!("Failed to create temp checkpoint file: {}", tmp_path.display())
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, checkpoint)
            .context("Failed to serialize checkpoint")?;
        writer.flush().context("Failed to flush checkpoint")?;
        writer
            .get_ref()
            .sync_all()
            .context("Failed to sync checkpoint")?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!("Failed to rename temp checkpoint: {}", self.path.display())
        })?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        clear(&self.path)?;
        *lock(&self.state) = Checkpoint::default();
        Ok(())
    }
}
