//! Error taxonomy for the snapshot-chain manager.
//!
//! Every failure a caller can act on gets its own variant; collaborator
//! failures (image tool, hypervisor agent, filesystem) are wrapped with the
//! volume/snapshot/operation context they happened under and re-raised.
//! The manager never retries an image mutation on its own — a half-applied
//! commit retried blindly can corrupt the chain, so transient-failure retry
//! policy stays with the surrounding driver framework.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockKey;
use crate::volume::VolumeId;

pub type Result<T> = std::result::Result<T, ChainError>;

#[derive(Debug, Error)]
pub enum ChainError {
    /// An image file could not be probed (unreadable or unrecognized).
    #[error("probe failed for {}: {reason}", .path.display())]
    Probe { path: PathBuf, reason: String },

    /// Walking a backing chain revisited a filename or exceeded the depth cap.
    #[error("backing chain starting at {} is cyclic or deeper than {depth}: repeated/last file {file}", .start.display())]
    ChainCycle {
        start: PathBuf,
        file: String,
        depth: usize,
    },

    /// A snapshot file has more than one direct child. The manager never
    /// creates branched chains, so it refuses to guess how to collapse one.
    #[error("file {file} of volume {volume} has {children} children; refusing to merge a branched chain")]
    UnsupportedChainTopology {
        volume: VolumeId,
        file: String,
        children: usize,
    },

    /// The per-volume metadata document exists but cannot be used.
    #[error("invalid chain metadata for volume {volume} at {}: {reason}", .path.display())]
    InvalidMetadata {
        volume: VolumeId,
        path: PathBuf,
        reason: String,
    },

    /// The hypervisor agent did not confirm a live merge within the bound.
    /// Metadata is only written after confirmation, so the volume is still
    /// in its pre-merge state.
    #[error("live merge of {file} on volume {volume} not confirmed after {waited:?}")]
    MergeTimeout {
        volume: VolumeId,
        file: String,
        waited: Duration,
    },

    /// The hypervisor agent reported the merge job as failed.
    #[error("live merge of {file} on volume {volume} failed: {reason}")]
    MergeFailed {
        volume: VolumeId,
        file: String,
        reason: String,
    },

    /// Resize completed but the re-probed virtual size does not match the
    /// request. No rollback is attempted; surfaced for remediation.
    #[error("extend of volume {volume} requested {requested} bytes but head reports {actual}")]
    ExtendVerification {
        volume: VolumeId,
        requested: u64,
        actual: u64,
    },

    /// Extend called with a size not strictly larger than the current one.
    #[error("new size {requested} must exceed current size {current} of volume {volume}")]
    InvalidSize {
        volume: VolumeId,
        current: u64,
        requested: u64,
    },

    /// A named lock could not be acquired within the configured bound.
    #[error("timed out acquiring {key} after {waited:?}")]
    LockTimeout { key: LockKey, waited: Duration },

    /// The request is well-formed but this manager refuses to perform it
    /// (e.g. resize of a vhd head that has snapshots behind it).
    #[error("unsupported operation on volume {volume}: {reason}")]
    UnsupportedOperation { volume: VolumeId, reason: String },

    /// An image-operations collaborator call failed.
    #[error("image operation `{op}` on {} failed: {reason}", .path.display())]
    ImageOps {
        op: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Filesystem access around the chain (metadata file, file deletes,
    /// directory scans) failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ChainError {
    /// Wrap an io::Error with a human-readable context string.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ChainError::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand used by `ImageOps` implementations.
    pub fn image_op(op: &'static str, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ChainError::ImageOps {
            op,
            path: path.into(),
            reason: reason.into(),
        }
    }
}
