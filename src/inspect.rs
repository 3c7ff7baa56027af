//! inspect — backing-chain inspector.
//!
//! Thin layer over the image-ops `probe`: resolves backing references
//! relative to each image's directory, walks head -> terminal base, caps
//! the depth and detects repeated filenames (a cycle on disk would
//! otherwise loop forever).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::errors::{ChainError, Result};
use crate::ops::{ImageOps, ProbeInfo};

/// One link of a walked chain, head first.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub path: PathBuf,
    pub info: ProbeInfo,
}

pub struct Inspector {
    ops: Arc<dyn ImageOps>,
    max_depth: usize,
}

impl Inspector {
    pub fn new(ops: Arc<dyn ImageOps>, max_depth: usize) -> Self {
        Inspector { ops, max_depth }
    }

    /// Probe one image file. Collaborator failures come back as `Probe`
    /// with the path attached.
    pub fn probe(&self, path: &Path) -> Result<ProbeInfo> {
        self.ops.probe(path).map_err(|e| ChainError::Probe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Resolve a backing reference of `image` to a full path. Relative
    /// references live in the image's own directory.
    pub fn resolve_backing(&self, image: &Path, backing: &str) -> PathBuf {
        let b = Path::new(backing);
        if b.is_absolute() {
            return b.to_path_buf();
        }
        match image.parent() {
            Some(dir) => dir.join(b),
            None => b.to_path_buf(),
        }
    }

    /// Walk the chain from `start` (the head) to the terminal base, by
    /// repeated probing. Fails `ChainCycle` on a repeated filename or when
    /// the depth cap is exceeded.
    pub fn chain(&self, start: &Path) -> Result<Vec<ChainEntry>> {
        let mut entries = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = start.to_path_buf();

        loop {
            let name = current
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| current.to_string_lossy().into_owned());
            if !seen.insert(name.clone()) || entries.len() >= self.max_depth {
                return Err(ChainError::ChainCycle {
                    start: start.to_path_buf(),
                    file: name,
                    depth: entries.len(),
                });
            }

            let info = self.probe(&current)?;
            let next = info
                .backing_file
                .as_deref()
                .map(|b| self.resolve_backing(&current, b));
            entries.push(ChainEntry {
                path: current.clone(),
                info,
            });

            match next {
                Some(n) => current = n,
                None => break,
            }
        }
        debug!(
            "chain from {} has {} file(s)",
            start.display(),
            entries.len()
        );
        Ok(entries)
    }
}
