//! Boundaries to the two external collaborators.
//!
//! Both are opaque services behind traits, injected into the manager at
//! construction time (no ambient globals):
//! - [`ImageOps`]: the image-manipulation tool (qemu-img or equivalent).
//! - [`HypervisorAgent`]: the host-side agent performing live snapshot and
//!   live merge on an attached volume.
//!
//! The manager treats every call as blocking; a call into either
//! collaborator parks the calling worker for its duration.

use std::fmt;
use std::path::Path;

use crate::errors::Result;
use crate::volume::{ImageFormat, VolumeId};

/// Result of probing one image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub format: ImageFormat,
    /// Backing-file reference as stored in the image. Relative names are
    /// resolved against the image's own directory.
    pub backing_file: Option<String>,
    pub virtual_size: u64,
}

/// How `rebase` moves (or does not move) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseMode {
    /// Rewrite the backing pointer only. Valid when the new backing file
    /// already provides the same data the old one did.
    Pointer,
    /// Pull the blocks that differ between old and new backing into the
    /// file itself, then switch the pointer.
    Pull,
}

/// Image-manipulation tool boundary.
pub trait ImageOps: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeInfo>;

    /// Create a new differencing (COW) file at `new_path` backed by
    /// `backing`, inheriting its virtual size.
    fn create_differencing(&self, new_path: &Path, backing: &Path) -> Result<()>;

    /// Create a new independent image with no backing file.
    fn create_independent(&self, new_path: &Path, size_bytes: u64, format: ImageFormat) -> Result<()>;

    /// Fold a child's data into its backing file. The caller deletes the
    /// child afterwards.
    fn commit(&self, child: &Path) -> Result<()>;

    fn resize(&self, path: &Path, new_size_bytes: u64) -> Result<()>;

    /// Flatten `src` (reading through its whole chain) into an independent
    /// file at `dst`.
    fn convert(&self, src: &Path, dst: &Path, dst_format: ImageFormat) -> Result<()>;

    /// Point `path` at a different backing file (`None` detaches it).
    fn rebase(&self, path: &Path, new_backing: Option<&Path>, mode: RebaseMode) -> Result<()>;
}

/// Opaque handle to an in-flight live merge job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeToken(pub String);

impl fmt::Display for MergeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    Done,
    Pending,
    Failed(String),
}

/// Host-side agent boundary for attached (in-use) volumes. The core never
/// touches files of an attached volume directly; it asks the agent and
/// waits for confirmation.
pub trait HypervisorAgent: Send + Sync {
    /// Create a new COW layer on top of the attached volume's current head.
    /// Returns the basename of the created file (the agent may adjust the
    /// suggested path).
    fn live_snapshot(&self, volume: &VolumeId, new_path: &Path) -> Result<String>;

    /// Start folding `file_to_merge` into its backing file on the attached
    /// chain.
    fn request_merge(&self, volume: &VolumeId, file_to_merge: &Path) -> Result<MergeToken>;

    /// Non-blocking job status check; the manager turns this into a bounded
    /// blocking wait.
    fn poll_merge(&self, token: &MergeToken) -> Result<MergeStatus>;
}
