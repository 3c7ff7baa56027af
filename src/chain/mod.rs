//! chain — the snapshot chain manager (core orchestrator).
//!
//! Split by operation:
//! - mod.rs      — ChainManager type, construction, locking, dir scans,
//!                 metadata bootstrap, display-only helpers
//! - snapshot.rs — create_snapshot / delete_snapshot (offline and live)
//! - clone.rs    — clone_volume_from_source (layered and flattened)
//! - extend.rs   — extend_volume
//!
//! One instance per backend, owning injected collaborators. Every mutating
//! operation follows the same shape: acquire lock -> read metadata ->
//! inspect chain -> issue image op (or delegate to the live-merge agent) ->
//! persist metadata -> release lock (guard drop).

pub mod clone;
pub mod extend;
pub mod snapshot;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::config::ChainConfig;
use crate::errors::{ChainError, Result};
use crate::inspect::{ChainEntry, Inspector};
use crate::lock::{LockGuard, LockKey, LockManager};
use crate::metadata::{self, ChainMetadata};
use crate::ops::{HypervisorAgent, ImageOps};
use crate::volume::{Snapshot, SnapshotId, SnapshotStatus, Volume};

/// Orchestrates all chain mutations for the volumes of one backend.
pub struct ChainManager {
    pub(crate) ops: Arc<dyn ImageOps>,
    pub(crate) agent: Arc<dyn HypervisorAgent>,
    pub(crate) locks: LockManager,
    pub(crate) cfg: ChainConfig,
}

impl ChainManager {
    pub fn new(ops: Arc<dyn ImageOps>, agent: Arc<dyn HypervisorAgent>, cfg: ChainConfig) -> Self {
        ChainManager {
            ops,
            agent,
            locks: LockManager::new(),
            cfg,
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.cfg
    }

    pub(crate) fn inspector(&self) -> Inspector {
        Inspector::new(Arc::clone(&self.ops), self.cfg.max_chain_depth)
    }

    /// Acquire a named lock, bounded by the configured lock timeout.
    pub(crate) fn lock(&self, key: LockKey) -> Result<LockGuard> {
        match self.cfg.lock_timeout {
            Some(t) => self.locks.acquire_timeout(key, t),
            None => Ok(self.locks.acquire(key)),
        }
    }

    /// Write the initial metadata document (single `active` entry pointing
    /// at the conventional base file). Called once at volume creation by
    /// the surrounding framework.
    pub fn init_metadata(&self, volume: &Volume) -> Result<()> {
        let _g = self.lock(LockKey::Volume(volume.id.clone()))?;
        if metadata::load(volume)?.is_some() {
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: "chain metadata already initialized".to_string(),
            });
        }
        metadata::save(volume, &ChainMetadata::new(volume.base_name()))
    }

    /// Full path of the current chain head.
    pub(crate) fn active_path(&self, volume: &Volume) -> Result<(String, PathBuf)> {
        let name = metadata::active_image(volume)?;
        let path = volume.dir.join(&name);
        Ok((name, path))
    }

    /// Files in the volume's directory whose backing pointer names `file`.
    ///
    /// The directory is ground truth, so every image file is a candidate,
    /// not just the ones carrying this volume's name: a layered clone
    /// lives in the same directory under another volume's name and still
    /// reads through the source's frozen file. Backing references are
    /// compared by final path component.
    pub(crate) fn children_of(&self, volume: &Volume, file: &str) -> Result<Vec<String>> {
        let meta_suffix = format!(".{}", metadata::METADATA_SUFFIX);

        let rd = fs::read_dir(&volume.dir).map_err(|e| {
            ChainError::io(format!("scan volume dir {}", volume.dir.display()), e)
        })?;

        let mut children = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| {
                ChainError::io(format!("scan volume dir {}", volume.dir.display()), e)
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == file || name.ends_with(&meta_suffix) || name.ends_with(".tmp") {
                continue;
            }
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match self.ops.probe(&entry.path()) {
                Ok(info) => {
                    let backs_file = info
                        .backing_file
                        .as_deref()
                        .and_then(|b| Path::new(b).file_name())
                        .map(|n| n.to_string_lossy() == file)
                        .unwrap_or(false);
                    if backs_file {
                        children.push(name);
                    }
                }
                // A file we cannot probe cannot be proven to be a child;
                // leave it to verify_chain() to report.
                Err(e) => warn!("children_of: skipping unprobeable {name}: {e}"),
            }
        }
        children.sort();
        Ok(children)
    }

    /// Display-only: does the metadata record this snapshot? Lock-free by
    /// design, never use the answer for a mutating decision.
    pub fn snapshot_exists(&self, volume: &Volume, id: &SnapshotId) -> Result<bool> {
        Ok(metadata::load(volume)?
            .map(|m| m.contains_snapshot(id))
            .unwrap_or(false))
    }

    /// Display-only listing of the volume's snapshots.
    pub fn list_snapshots(&self, volume: &Volume) -> Result<Vec<Snapshot>> {
        let Some(meta) = metadata::load(volume)? else {
            return Ok(Vec::new());
        };
        Ok(meta
            .snapshots()
            .map(|(id, file)| Snapshot {
                id: SnapshotId(id.to_string()),
                volume_id: volume.id.clone(),
                status: SnapshotStatus::Available,
                file: file.to_string(),
            })
            .collect())
    }

    /// Display-only consistency pass: walk the chain from the active head
    /// and report metadata entries whose file is gone. Walking alone
    /// already proves the no-cycle/termination invariant (or fails
    /// `ChainCycle`).
    pub fn verify_chain(&self, volume: &Volume) -> Result<ChainReport> {
        let (_, head) = self.active_path(volume)?;
        let entries = self.inspector().chain(&head)?;
        let mut missing = Vec::new();
        if let Some(meta) = metadata::load(volume)? {
            for file in meta.files() {
                if !volume.dir.join(file).exists() {
                    missing.push(file.to_string());
                }
            }
        }
        Ok(ChainReport { entries, missing })
    }
}

/// Outcome of [`ChainManager::verify_chain`].
#[derive(Debug)]
pub struct ChainReport {
    /// The walked chain, head first.
    pub entries: Vec<ChainEntry>,
    /// Metadata filenames with no file on disk.
    pub missing: Vec<String>,
}

impl ChainReport {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty()
    }
}
