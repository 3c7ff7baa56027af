//! Snapshot create/delete.
//!
//! Both operations keep one rule above all others: the file set on disk is
//! mutated first, and the metadata document is persisted only after that
//! mutation succeeded. A crash between the two steps of `create_snapshot`
//! leaves an extra (harmless) file; in `delete_snapshot` it can leave a
//! metadata entry whose file is already gone. `verify_chain` reports such
//! entries, and retrying the delete clears them.

use std::fs;
use std::thread;
use std::time::Instant;

use log::{debug, info};

use crate::config::FoldPolicy;
use crate::errors::{ChainError, Result};
use crate::lock::LockKey;
use crate::metadata::{self, ChainMetadata, ACTIVE_KEY};
use crate::ops::{MergeStatus, RebaseMode};
use crate::volume::{Snapshot, SnapshotId, SnapshotStatus, Volume, VolumeStatus};

use super::ChainManager;

impl ChainManager {
    /// Take a point-in-time snapshot: the current head `A` freezes and a
    /// new differencing head `B` (backed by `A`) starts receiving writes.
    ///
    /// Offline volumes get the new layer from the image tool directly; an
    /// attached volume delegates layer creation to the hypervisor agent
    /// and trusts the filename it reports back.
    pub fn create_snapshot(&self, volume: &Volume, snapshot_id: &SnapshotId) -> Result<Snapshot> {
        let _g = self.lock(LockKey::Volume(volume.id.clone()))?;

        if snapshot_id.as_str() == ACTIVE_KEY {
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: format!("`{ACTIVE_KEY}` is a reserved snapshot id"),
            });
        }

        let mut meta =
            metadata::load(volume)?.unwrap_or_else(|| ChainMetadata::new(volume.base_name()));
        if meta.contains_snapshot(snapshot_id) {
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: format!("snapshot {snapshot_id} already recorded"),
            });
        }

        let frozen = meta
            .active()
            .map(str::to_string)
            .unwrap_or_else(|| volume.base_name());
        let backing = volume.dir.join(&frozen);
        let suggested = volume.snapshot_head_name(snapshot_id);
        let new_path = volume.dir.join(&suggested);

        let new_head = match volume.status {
            VolumeStatus::Available => {
                info!(
                    "create_snapshot {snapshot_id} on volume {}: new head {suggested} over {frozen}",
                    volume.id
                );
                self.ops.create_differencing(&new_path, &backing)?;
                suggested
            }
            VolumeStatus::InUse => {
                info!(
                    "create_snapshot {snapshot_id} on attached volume {}: delegating to agent",
                    volume.id
                );
                self.agent.live_snapshot(&volume.id, &new_path)?
            }
            VolumeStatus::Error => {
                return Err(ChainError::UnsupportedOperation {
                    volume: volume.id.clone(),
                    reason: "volume is in error state".to_string(),
                })
            }
        };

        // The new head exists on disk; only now may the index change.
        meta.insert_snapshot(snapshot_id, frozen.clone());
        meta.set_active(new_head);
        metadata::save(volume, &meta)?;

        Ok(Snapshot {
            id: snapshot_id.clone(),
            volume_id: volume.id.clone(),
            status: SnapshotStatus::Available,
            file: frozen,
        })
    }

    /// Delete a snapshot, merging its file out of the chain if anything
    /// still reads through it. Idempotent: an id the metadata does not
    /// know succeeds silently (the surrounding system retries deletes).
    pub fn delete_snapshot(&self, volume: &Volume, snapshot_id: &SnapshotId) -> Result<()> {
        // Volume first, then snapshot: same order everywhere, so the pair
        // cannot deadlock against the volume-level operations.
        let _vol = self.lock(LockKey::Volume(volume.id.clone()))?;
        let _snap = self.lock(LockKey::Snapshot(volume.id.clone(), snapshot_id.clone()))?;

        let Some(mut meta) = metadata::load(volume)? else {
            debug!("delete_snapshot {snapshot_id}: volume {} has no metadata, nothing to do", volume.id);
            return Ok(());
        };
        let Some(file) = meta.snapshot_file(snapshot_id).map(str::to_string) else {
            debug!("delete_snapshot {snapshot_id}: not recorded on volume {}, nothing to do", volume.id);
            return Ok(());
        };

        if meta.active() == Some(file.as_str()) {
            // create_snapshot never records the head under a snapshot id;
            // seeing it here means the index was edited behind our back.
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: format!("snapshot {snapshot_id} names the active image {file}"),
            });
        }

        let children = self.children_of(volume, &file)?;
        match children.as_slice() {
            [] => {
                info!(
                    "delete_snapshot {snapshot_id} on volume {}: removing tail file {file}",
                    volume.id
                );
                let path = volume.dir.join(&file);
                // The file may already be gone if an earlier delete was
                // interrupted after removing it but before persisting.
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(ChainError::io(format!("remove {}", path.display()), e))
                    }
                }
                meta.remove_snapshot(snapshot_id);
                metadata::save(volume, &meta)
            }
            [child] => self.merge_one_child(volume, snapshot_id, &mut meta, &file, child),
            many => Err(ChainError::UnsupportedChainTopology {
                volume: volume.id.clone(),
                file,
                children: many.len(),
            }),
        }
    }

    /// Interior merge: `file` has exactly one child reading through it.
    fn merge_one_child(
        &self,
        volume: &Volume,
        snapshot_id: &SnapshotId,
        meta: &mut ChainMetadata,
        file: &str,
        child: &str,
    ) -> Result<()> {
        let file_path = volume.dir.join(file);
        let child_path = volume.dir.join(child);

        if volume.status == VolumeStatus::InUse {
            // The agent folds the child down and rewires the live chain;
            // we only wait for confirmation, then clean up the now
            // unreferenced file and fix the index.
            info!(
                "delete_snapshot {snapshot_id} on attached volume {}: live merge of {child} into {file}",
                volume.id
            );
            self.wait_for_live_merge(volume, child)?;
            fs::remove_file(&child_path)
                .map_err(|e| ChainError::io(format!("remove {}", child_path.display()), e))?;
            meta.remove_snapshot(snapshot_id);
            meta.retarget(child, file);
            return metadata::save(volume, meta);
        }

        match self.cfg.fold_policy {
            FoldPolicy::ChildIntoParent => {
                info!(
                    "delete_snapshot {snapshot_id} on volume {}: committing {child} into {file}",
                    volume.id
                );
                self.ops.commit(&child_path)?;
                // Anything that read through the child now reads through
                // the parent, which holds the child's data.
                for grandchild in self.children_of(volume, child)? {
                    self.ops.rebase(
                        &volume.dir.join(grandchild),
                        Some(&file_path),
                        RebaseMode::Pointer,
                    )?;
                }
                fs::remove_file(&child_path)
                    .map_err(|e| ChainError::io(format!("remove {}", child_path.display()), e))?;
                meta.remove_snapshot(snapshot_id);
                meta.retarget(child, file);
            }
            FoldPolicy::ParentIntoChild => {
                info!(
                    "delete_snapshot {snapshot_id} on volume {}: pulling {file} into {child}",
                    volume.id
                );
                let insp = self.inspector();
                let grandparent = insp
                    .probe(&file_path)?
                    .backing_file
                    .map(|b| insp.resolve_backing(&file_path, &b));
                self.ops
                    .rebase(&child_path, grandparent.as_deref(), RebaseMode::Pull)?;
                fs::remove_file(&file_path)
                    .map_err(|e| ChainError::io(format!("remove {}", file_path.display()), e))?;
                meta.remove_snapshot(snapshot_id);
                // Earlier merges can leave more entries naming the parent.
                meta.retarget(file, child);
            }
        }
        metadata::save(volume, meta)
    }

    /// Ask the agent to merge `file` and block until it confirms, bounded
    /// by the configured timeout. On timeout or failure nothing has been
    /// persisted, so the volume is still in its pre-merge state.
    fn wait_for_live_merge(&self, volume: &Volume, file: &str) -> Result<()> {
        let path = volume.dir.join(file);
        let token = self.agent.request_merge(&volume.id, &path)?;
        let deadline = Instant::now() + self.cfg.merge_timeout;

        loop {
            match self.agent.poll_merge(&token)? {
                MergeStatus::Done => {
                    debug!("live merge {token} on volume {} confirmed", volume.id);
                    return Ok(());
                }
                MergeStatus::Failed(reason) => {
                    return Err(ChainError::MergeFailed {
                        volume: volume.id.clone(),
                        file: file.to_string(),
                        reason,
                    })
                }
                MergeStatus::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChainError::MergeTimeout {
                            volume: volume.id.clone(),
                            file: file.to_string(),
                            waited: self.cfg.merge_timeout,
                        });
                    }
                    thread::sleep(self.cfg.merge_poll_interval.min(deadline - now));
                }
            }
        }
    }
}
