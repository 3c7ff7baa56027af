//! Volume extend (grow only).
//!
//! Resizes the unique chain head in place and verifies the result by
//! re-probing. There is no rollback on a failed verification: a resize we
//! cannot confirm is surfaced as `ExtendVerification` for remediation
//! rather than papered over with a second mutation.

use log::info;

use crate::errors::{ChainError, Result};
use crate::lock::LockKey;
use crate::metadata;
use crate::volume::{Volume, VolumeStatus};

use super::ChainManager;

impl ChainManager {
    pub fn extend_volume(&self, volume: &Volume, new_size_bytes: u64) -> Result<()> {
        let _g = self.lock(LockKey::Volume(volume.id.clone()))?;

        if volume.status != VolumeStatus::Available {
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: "extend of an attached volume".to_string(),
            });
        }

        let (active, head) = self.active_path(volume)?;
        let before = self.inspector().probe(&head)?;
        if new_size_bytes <= before.virtual_size {
            return Err(ChainError::InvalidSize {
                volume: volume.id.clone(),
                current: before.virtual_size,
                requested: new_size_bytes,
            });
        }

        let snapshots = metadata::load(volume)?
            .map(|m| m.snapshot_count())
            .unwrap_or(0);
        if snapshots > 0 && !volume.format.supports_differencing_resize() {
            return Err(ChainError::UnsupportedOperation {
                volume: volume.id.clone(),
                reason: format!(
                    "cannot resize a {} head above {snapshots} snapshot(s)",
                    volume.format
                ),
            });
        }

        // Only the unique head may grow; a file something reads through
        // must keep its size.
        let children = self.children_of(volume, &active)?;
        if !children.is_empty() {
            return Err(ChainError::UnsupportedChainTopology {
                volume: volume.id.clone(),
                file: active,
                children: children.len(),
            });
        }

        info!(
            "extend volume {}: {active} {} -> {new_size_bytes} bytes",
            volume.id, before.virtual_size
        );
        self.ops.resize(&head, new_size_bytes)?;

        let after = self.inspector().probe(&head)?;
        if after.virtual_size != new_size_bytes {
            return Err(ChainError::ExtendVerification {
                volume: volume.id.clone(),
                requested: new_size_bytes,
                actual: after.virtual_size,
            });
        }
        Ok(())
    }
}
