//! metadata — durable per-volume chain metadata document.
//!
//! File: `<volume.dir>/volume-<id>.info` (UTF-8 JSON object)
//! - required key `"active"`: basename of the chain head receiving writes;
//! - every other key: `snapshot-id -> basename` of that snapshot's frozen
//!   file.
//! Keys are kept sorted (BTreeMap) so dumps diff cleanly; the order is a
//! debugging nicety, not a wire contract.
//!
//! Policy:
//! - The file set on disk is ground truth; this document is a derived index
//!   written only after the filesystem mutation it describes succeeded.
//! - Atomic overwrite: tmp + rename, then fsync of the parent directory
//!   (best-effort on non-unix).
//! - Missing file is not an error (`load` returns None); a present but
//!   unparseable file is `InvalidMetadata`.
//! - `save` rejects a document without `active`.
//! - Mutations only while holding the volume's lock; lock-free `load` is
//!   for display only, never for a mutating decision.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, Result};
use crate::volume::{SnapshotId, Volume};

pub const ACTIVE_KEY: &str = "active";
pub const METADATA_SUFFIX: &str = "info";

/// The chain index: `active` plus snapshot-id -> filename pairs, stored as
/// one flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainMetadata {
    entries: BTreeMap<String, String>,
}

impl ChainMetadata {
    /// Fresh document for a volume whose head is `active`.
    pub fn new(active: impl Into<String>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ACTIVE_KEY.to_string(), active.into());
        ChainMetadata { entries }
    }

    pub fn active(&self) -> Option<&str> {
        self.entries.get(ACTIVE_KEY).map(|s| s.as_str())
    }

    pub fn set_active(&mut self, file: impl Into<String>) {
        self.entries.insert(ACTIVE_KEY.to_string(), file.into());
    }

    pub fn snapshot_file(&self, id: &SnapshotId) -> Option<&str> {
        self.entries.get(id.as_str()).map(|s| s.as_str())
    }

    pub fn insert_snapshot(&mut self, id: &SnapshotId, file: impl Into<String>) {
        self.entries.insert(id.as_str().to_string(), file.into());
    }

    pub fn remove_snapshot(&mut self, id: &SnapshotId) -> Option<String> {
        self.entries.remove(id.as_str())
    }

    pub fn contains_snapshot(&self, id: &SnapshotId) -> bool {
        self.entries.contains_key(id.as_str())
    }

    pub fn snapshot_count(&self) -> usize {
        self.entries.len() - usize::from(self.entries.contains_key(ACTIVE_KEY))
    }

    /// Snapshot entries only (`active` excluded), sorted by id.
    pub fn snapshots(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != ACTIVE_KEY)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every filename the document references (including `active`).
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|s| s.as_str())
    }

    /// Point every reference to `old` (the `active` pointer or any snapshot
    /// entry) at `new` instead. Returns how many entries changed.
    pub fn retarget(&mut self, old: &str, new: &str) -> usize {
        let mut changed = 0;
        for v in self.entries.values_mut() {
            if v == old {
                *v = new.to_string();
                changed += 1;
            }
        }
        changed
    }
}

/// Path of the metadata document for `volume`.
pub fn metadata_path(volume: &Volume) -> PathBuf {
    volume
        .dir
        .join(format!("volume-{}.{}", volume.id, METADATA_SUFFIX))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn invalid(volume: &Volume, path: &Path, reason: impl Into<String>) -> ChainError {
    ChainError::InvalidMetadata {
        volume: volume.id.clone(),
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Load the metadata document. A missing file means "uninitialized" and
/// returns Ok(None); anything present but unusable is `InvalidMetadata`.
pub fn load(volume: &Volume) -> Result<Option<ChainMetadata>> {
    let path = metadata_path(volume);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ChainError::io(format!("read metadata {}", path.display()), e)),
    };
    let meta: ChainMetadata =
        serde_json::from_slice(&bytes).map_err(|e| invalid(volume, &path, e.to_string()))?;
    if meta.active().is_none() {
        return Err(invalid(volume, &path, "missing required key `active`"));
    }
    Ok(Some(meta))
}

/// Atomically overwrite the metadata document (tmp + rename + dir fsync).
/// Only call while holding the volume's lock.
pub fn save(volume: &Volume, meta: &ChainMetadata) -> Result<()> {
    let path = metadata_path(volume);
    match meta.active() {
        Some(a) if !a.trim().is_empty() => {}
        _ => return Err(invalid(volume, &path, "refusing to persist metadata without `active`")),
    }

    let tmp = path.with_extension(format!("{}.tmp", METADATA_SUFFIX));
    let _ = fs::remove_file(&tmp); // best-effort

    let body = serde_json::to_vec_pretty(meta)
        .map_err(|e| invalid(volume, &path, format!("serialize: {e}")))?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| ChainError::io(format!("open metadata tmp {}", tmp.display()), e))?;
    f.write_all(&body)
        .and_then(|_| f.sync_all())
        .map_err(|e| ChainError::io(format!("write metadata tmp {}", tmp.display()), e))?;

    fs::rename(&tmp, &path).map_err(|e| {
        ChainError::io(format!("rename {} -> {}", tmp.display(), path.display()), e)
    })?;
    let _ = fsync_dir(&path);
    Ok(())
}

/// Basename of the chain head. Falls back to the conventional default name
/// when the volume has no metadata yet.
pub fn active_image(volume: &Volume) -> Result<String> {
    match load(volume)? {
        Some(meta) => match meta.active() {
            Some(a) => Ok(a.to_string()),
            None => Ok(volume.base_name()),
        },
        None => Ok(volume.base_name()),
    }
}
