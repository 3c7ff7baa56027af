//! Data model: volumes, snapshots and image formats.
//!
//! These are plain value structs — the manager never mutates them, it only
//! reads ids, paths and status. Backend-specific extras travel in an opaque
//! string map (`Volume::extra`) that the core carries but never inspects.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Volume identifier (UUID string in the surrounding framework).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        VolumeId(s.to_string())
    }
}

/// Snapshot identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        SnapshotId(s.to_string())
    }
}

/// Image file format of a volume's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Qcow2,
    Vhd,
    Vhdx,
    Raw,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Raw => "raw",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qcow2" => Some(ImageFormat::Qcow2),
            "vhd" | "vpc" => Some(ImageFormat::Vhd),
            "vhdx" => Some(ImageFormat::Vhdx),
            "raw" => Some(ImageFormat::Raw),
            _ => None,
        }
    }

    /// Whether the head of a multi-file chain can be resized in place
    /// without invalidating its differencing ancestry. qcow2 resizes the
    /// top layer reliably; vhd/vhdx differencing disks embed parent size
    /// assumptions, and raw has no differencing at all.
    pub fn supports_differencing_resize(&self) -> bool {
        matches!(self, ImageFormat::Qcow2)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    /// Offline: files are freely mutable by this manager.
    Available,
    /// Attached elsewhere: files are open by a hypervisor, all chain
    /// mutations go through the live-merge agent.
    InUse,
    Error,
}

/// A file-backed volume living in a directory on a shared filesystem.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: VolumeId,
    pub size_bytes: u64,
    /// Directory holding every file of this volume's chain plus its
    /// metadata document.
    pub dir: PathBuf,
    pub format: ImageFormat,
    pub status: VolumeStatus,
    /// Consistency boundary (share/pool name). Layered clones are only
    /// possible inside one domain.
    pub domain: String,
    /// Backend-specific extras, opaque to the core.
    pub extra: BTreeMap<String, String>,
}

impl Volume {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>, size_bytes: u64, format: ImageFormat) -> Self {
        Volume {
            id: VolumeId(id.into()),
            size_bytes,
            dir: dir.into(),
            format,
            status: VolumeStatus::Available,
            domain: "default".to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Conventional basename of the volume's original (terminal) image.
    /// Also the `active` fallback when metadata is uninitialized.
    pub fn base_name(&self) -> String {
        format!("volume-{}.{}", self.id, self.format.as_str())
    }

    /// Basename of the head file created when `snapshot_id` is taken.
    pub fn snapshot_head_name(&self, snapshot_id: &SnapshotId) -> String {
        format!("{}.{}", self.base_name(), snapshot_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Available,
    Error,
}

/// A point-in-time snapshot of a volume, recorded in the chain metadata.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub status: SnapshotStatus,
    /// Basename of the frozen image file holding this snapshot's view.
    pub file: String,
}
