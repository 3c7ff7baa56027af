//! Centralized configuration for the chain manager.
//!
//! Goals:
//! - Single place for tunables instead of scattered env lookups.
//! - ChainConfig::from_env() for the surrounding driver framework's
//!   process-level knobs; ChainConfigBuilder for embedding.
//!
//! Conservative defaults:
//! - merge wait: poll every 500 ms, give up after 10 minutes
//! - lock wait: unbounded (the worker-pool model expects blocking)
//! - layering on (constant-time clones inside one domain)
//! - fold policy: child-into-parent (the dominant backend behavior)

use std::path::PathBuf;
use std::time::Duration;

/// Direction a one-child snapshot delete collapses the chain in.
///
/// Backends disagree on this: most fold the child's delta down into the
/// parent and delete the child; a minority pull the parent's data up into
/// the child and delete the parent. Both are the same algorithm with the
/// roles swapped, so it is a policy knob rather than two code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldPolicy {
    /// Commit the child into the parent, delete the child, retarget
    /// references to the child at the parent.
    ChildIntoParent,
    /// Pull the parent's data into the child, delete the parent. The
    /// child keeps its name, so only the deleted snapshot's entry goes.
    ParentIntoChild,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(s) => {
            let s = s.trim().to_ascii_lowercase();
            matches!(s.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Top-level configuration consumed by `ChainManager`.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Maximum files walked in one backing chain before the inspector
    /// declares it broken. Env: SNAPCHAIN_MAX_DEPTH (default 64).
    pub max_chain_depth: usize,

    /// Interval between live-merge status polls.
    /// Env: SNAPCHAIN_MERGE_POLL_MS (default 500).
    pub merge_poll_interval: Duration,

    /// Total bound on a live-merge wait; past it the operation fails
    /// `MergeTimeout` with metadata untouched.
    /// Env: SNAPCHAIN_MERGE_TIMEOUT_MS (default 600000).
    pub merge_timeout: Duration,

    /// Bound on lock acquisition; None blocks indefinitely.
    /// Env: SNAPCHAIN_LOCK_TIMEOUT_MS (default unset).
    pub lock_timeout: Option<Duration>,

    /// Clone inside one domain as a differencing file instead of a full
    /// copy. Env: SNAPCHAIN_LAYERING (default true).
    pub layering: bool,

    /// Shared cache directory for clone sources, keyed by snapshot id and
    /// populated on first use. None disables the cache.
    /// Env: SNAPCHAIN_CLONE_CACHE_DIR (default unset).
    pub clone_cache_dir: Option<PathBuf>,

    /// Direction of the one-child snapshot merge.
    /// Env: SNAPCHAIN_FOLD_POLICY = "child-into-parent" | "parent-into-child".
    pub fold_policy: FoldPolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            max_chain_depth: 64,
            merge_poll_interval: Duration::from_millis(500),
            merge_timeout: Duration::from_secs(600),
            lock_timeout: None,
            layering: true,
            clone_cache_dir: None,
            fold_policy: FoldPolicy::ChildIntoParent,
        }
    }
}

impl ChainConfig {
    /// Defaults overridden by SNAPCHAIN_* environment variables.
    pub fn from_env() -> Self {
        let d = ChainConfig::default();
        let fold_policy = match std::env::var("SNAPCHAIN_FOLD_POLICY") {
            Ok(s) if s.trim().eq_ignore_ascii_case("parent-into-child") => {
                FoldPolicy::ParentIntoChild
            }
            _ => d.fold_policy,
        };
        ChainConfig {
            max_chain_depth: env_u64("SNAPCHAIN_MAX_DEPTH", d.max_chain_depth as u64) as usize,
            merge_poll_interval: Duration::from_millis(env_u64(
                "SNAPCHAIN_MERGE_POLL_MS",
                d.merge_poll_interval.as_millis() as u64,
            )),
            merge_timeout: Duration::from_millis(env_u64(
                "SNAPCHAIN_MERGE_TIMEOUT_MS",
                d.merge_timeout.as_millis() as u64,
            )),
            lock_timeout: std::env::var("SNAPCHAIN_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .map(Duration::from_millis),
            layering: env_bool("SNAPCHAIN_LAYERING", d.layering),
            clone_cache_dir: std::env::var("SNAPCHAIN_CLONE_CACHE_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            fold_policy,
        }
    }

    pub fn builder() -> ChainConfigBuilder {
        ChainConfigBuilder::default()
    }
}

/// Builder over `ChainConfig` for embedders that do not want env coupling.
#[derive(Debug, Clone, Default)]
pub struct ChainConfigBuilder {
    cfg: Option<ChainConfig>,
}

impl ChainConfigBuilder {
    fn cfg(&mut self) -> &mut ChainConfig {
        self.cfg.get_or_insert_with(ChainConfig::default)
    }

    pub fn max_chain_depth(mut self, depth: usize) -> Self {
        self.cfg().max_chain_depth = depth;
        self
    }

    pub fn merge_poll_interval(mut self, interval: Duration) -> Self {
        self.cfg().merge_poll_interval = interval;
        self
    }

    pub fn merge_timeout(mut self, timeout: Duration) -> Self {
        self.cfg().merge_timeout = timeout;
        self
    }

    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cfg().lock_timeout = timeout;
        self
    }

    pub fn layering(mut self, on: bool) -> Self {
        self.cfg().layering = on;
        self
    }

    pub fn clone_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cfg().clone_cache_dir = dir;
        self
    }

    pub fn fold_policy(mut self, policy: FoldPolicy) -> Self {
        self.cfg().fold_policy = policy;
        self
    }

    pub fn build(mut self) -> ChainConfig {
        self.cfg().clone()
    }
}
