//! snapchain — copy-on-write snapshot-chain manager for file-backed
//! volume drivers.
//!
//! Volumes live as backing-file chains (qcow2/vhd/vhdx) on a shared
//! filesystem, indexed by a durable per-volume JSON document. This crate
//! is the chain manager those drivers share: snapshot create/delete,
//! clone, extend — offline via the image tool, online via a hypervisor
//! agent. It is a library; CLI and configuration loading belong to the
//! surrounding driver framework.

// Leaf modules
pub mod config;
pub mod errors;
pub mod inspect;
pub mod lock;
pub mod metadata;
pub mod ops;
pub mod volume;

// Core orchestrator: src/chain/{mod,snapshot,clone,extend}.rs
pub mod chain;

// Convenient re-exports
pub use chain::{ChainManager, ChainReport};
pub use config::{ChainConfig, ChainConfigBuilder, FoldPolicy};
pub use errors::{ChainError, Result};
pub use inspect::{ChainEntry, Inspector};
pub use lock::{LockGuard, LockKey, LockManager};
pub use metadata::ChainMetadata;
pub use ops::{HypervisorAgent, ImageOps, MergeStatus, MergeToken, ProbeInfo, RebaseMode};
pub use volume::{
    ImageFormat, Snapshot, SnapshotId, SnapshotStatus, Volume, VolumeId, VolumeStatus,
};
