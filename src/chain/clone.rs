//! Volume cloning.
//!
//! Two shapes, picked by domain and configuration:
//! - layered: the clone's head is a differencing file over the source's
//!   frozen image (or over a shared cache entry keyed by the source
//!   snapshot, populated on first use) — constant-time, same domain only;
//! - flattened: a full linear copy into one independent head, chain depth 1.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::errors::{ChainError, Result};
use crate::lock::LockKey;
use crate::metadata::{self, ChainMetadata};
use crate::volume::{SnapshotId, Volume, VolumeStatus};

use super::ChainManager;

impl ChainManager {
    /// Create `new_volume`'s head from `source` (optionally from one of
    /// its snapshots) and write the clone's initial metadata.
    pub fn clone_volume_from_source(
        &self,
        new_volume: &Volume,
        source: &Volume,
        source_snapshot: Option<&SnapshotId>,
    ) -> Result<()> {
        if new_volume.id == source.id {
            return Err(ChainError::UnsupportedOperation {
                volume: source.id.clone(),
                reason: "clone target and source are the same volume".to_string(),
            });
        }
        // Both volume locks, ordered by id, so two concurrent clones
        // touching the same pair cannot deadlock.
        let (first, second) = if new_volume.id < source.id {
            (&new_volume.id, &source.id)
        } else {
            (&source.id, &new_volume.id)
        };
        let _g1 = self.lock(LockKey::Volume(first.clone()))?;
        let _g2 = self.lock(LockKey::Volume(second.clone()))?;

        let frozen = match source_snapshot {
            Some(snap) => metadata::load(source)?
                .and_then(|m| m.snapshot_file(snap).map(str::to_string))
                .ok_or_else(|| ChainError::UnsupportedOperation {
                    volume: source.id.clone(),
                    reason: format!("source snapshot {snap} is not recorded"),
                })?,
            None => {
                if source.status != VolumeStatus::Available {
                    return Err(ChainError::UnsupportedOperation {
                        volume: source.id.clone(),
                        reason: "cloning the live head of an attached volume".to_string(),
                    });
                }
                metadata::active_image(source)?
            }
        };
        let src_path = source.dir.join(&frozen);

        let head_name = new_volume.base_name();
        let head_path = new_volume.dir.join(&head_name);

        // A layered clone must back onto a frozen image. Without a source
        // snapshot the only image is the writable active head, so the
        // clone always flattens in that case.
        let layered = self.cfg.layering
            && new_volume.domain == source.domain
            && source_snapshot.is_some();
        if layered {
            let backing = self.layered_backing(source, source_snapshot, &src_path)?;
            info!(
                "clone volume {} from {}: differencing head over {}",
                new_volume.id,
                source.id,
                backing.display()
            );
            self.ops.create_differencing(&head_path, &backing)?;
        } else {
            info!(
                "clone volume {} from {}: flattening {frozen}",
                new_volume.id, source.id
            );
            self.ops.convert(&src_path, &head_path, new_volume.format)?;
        }

        // Reconcile size: the copy inherits the source's virtual size.
        let head_info = self.inspector().probe(&head_path)?;
        if new_volume.size_bytes > head_info.virtual_size {
            self.ops.resize(&head_path, new_volume.size_bytes)?;
        }

        metadata::save(new_volume, &ChainMetadata::new(head_name))
    }

    /// Backing file for a layered clone: the source's frozen file, or a
    /// shared cache entry keyed by the snapshot id. The cache entry is a
    /// flattened copy so it stays valid after the source chain mutates.
    fn layered_backing(
        &self,
        source: &Volume,
        source_snapshot: Option<&SnapshotId>,
        src_path: &Path,
    ) -> Result<PathBuf> {
        let (Some(snap), Some(cache_dir)) = (source_snapshot, &self.cfg.clone_cache_dir) else {
            return Ok(src_path.to_path_buf());
        };
        let entry = cache_dir.join(format!("{}.{}", snap, source.format.as_str()));
        if !entry.exists() {
            fs::create_dir_all(cache_dir).map_err(|e| {
                ChainError::io(format!("create clone cache dir {}", cache_dir.display()), e)
            })?;
            info!(
                "clone cache miss for snapshot {snap}: converting {} -> {}",
                src_path.display(),
                entry.display()
            );
            self.ops.convert(src_path, &entry, source.format)?;
        }
        Ok(entry)
    }
}
