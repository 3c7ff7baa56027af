// Each integration-test binary pulls in the parts of this module it needs.
#![allow(dead_code)]

// Shared test doubles: a fake image tool and a fake hypervisor agent that
// operate on real files in a temp directory.
//
// A "fake image" is a JSON file: format, optional backing reference,
// virtual size, and a data map standing in for written blocks. COW
// semantics are real: reading resolves through the backing chain, commit
// folds a child's map into its backing file, convert flattens.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use snapchain::{
    ChainError, HypervisorAgent, ImageFormat, ImageOps, MergeStatus, MergeToken, ProbeInfo,
    RebaseMode, Result as ChainResult, VolumeId,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("snapchain-{prefix}-{pid}-{t}-{id}"));
    fs::create_dir_all(&root).unwrap();
    root
}

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeImage {
    format: String,
    backing_file: Option<String>,
    virtual_size: u64,
    data: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct FakeImageOps {
    /// Make create_differencing fail without creating the file.
    pub fail_create: AtomicBool,
    /// Make resize a silent no-op, so verification catches it.
    pub lie_on_resize: AtomicBool,
    /// How many convert calls ran (clone-cache population counting).
    pub convert_calls: AtomicUsize,
}

impl FakeImageOps {
    pub fn new() -> Self {
        FakeImageOps::default()
    }

    fn read(&self, path: &Path) -> ChainResult<FakeImage> {
        let bytes = fs::read(path)
            .map_err(|e| ChainError::image_op("probe", path, format!("unreadable: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::image_op("probe", path, format!("unrecognized: {e}")))
    }

    fn write(&self, path: &Path, img: &FakeImage) -> ChainResult<()> {
        let body = serde_json::to_vec_pretty(img)
            .map_err(|e| ChainError::image_op("write", path, e.to_string()))?;
        fs::write(path, body).map_err(|e| ChainError::image_op("write", path, e.to_string()))
    }

    fn resolve(&self, image: &Path, backing: &str) -> PathBuf {
        let b = Path::new(backing);
        if b.is_absolute() {
            b.to_path_buf()
        } else {
            image.parent().unwrap().join(b)
        }
    }

    fn backing_ref(&self, image: &Path, backing: &Path) -> String {
        if image.parent() == backing.parent() {
            backing.file_name().unwrap().to_string_lossy().into_owned()
        } else {
            backing.to_string_lossy().into_owned()
        }
    }

    /// Data visible through the whole chain starting at `path`.
    pub fn effective(&self, path: &Path) -> ChainResult<BTreeMap<String, String>> {
        let img = self.read(path)?;
        let mut data = match img.backing_file.as_deref() {
            Some(b) => self.effective(&self.resolve(path, b))?,
            None => BTreeMap::new(),
        };
        data.extend(img.data);
        Ok(data)
    }

    /// Simulate a guest write into the head at `path`.
    pub fn put(&self, path: &Path, key: &str, value: &str) {
        let mut img = self.read(path).unwrap();
        img.data.insert(key.to_string(), value.to_string());
        self.write(path, &img).unwrap();
    }
}

impl ImageOps for FakeImageOps {
    fn probe(&self, path: &Path) -> ChainResult<ProbeInfo> {
        let img = self.read(path)?;
        let format = ImageFormat::from_str_loose(&img.format)
            .ok_or_else(|| ChainError::image_op("probe", path, format!("format {}", img.format)))?;
        Ok(ProbeInfo {
            format,
            backing_file: img.backing_file,
            virtual_size: img.virtual_size,
        })
    }

    fn create_differencing(&self, new_path: &Path, backing: &Path) -> ChainResult<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ChainError::image_op("create", new_path, "injected failure"));
        }
        let base = self.read(backing)?;
        self.write(
            new_path,
            &FakeImage {
                format: base.format,
                backing_file: Some(self.backing_ref(new_path, backing)),
                virtual_size: base.virtual_size,
                data: BTreeMap::new(),
            },
        )
    }

    fn create_independent(
        &self,
        new_path: &Path,
        size_bytes: u64,
        format: ImageFormat,
    ) -> ChainResult<()> {
        self.write(
            new_path,
            &FakeImage {
                format: format.as_str().to_string(),
                backing_file: None,
                virtual_size: size_bytes,
                data: BTreeMap::new(),
            },
        )
    }

    fn commit(&self, child: &Path) -> ChainResult<()> {
        let c = self.read(child)?;
        let backing = c
            .backing_file
            .as_deref()
            .ok_or_else(|| ChainError::image_op("commit", child, "no backing file"))?;
        let parent_path = self.resolve(child, backing);
        let mut parent = self.read(&parent_path)?;
        parent.data.extend(c.data);
        self.write(&parent_path, &parent)
    }

    fn resize(&self, path: &Path, new_size_bytes: u64) -> ChainResult<()> {
        let mut img = self.read(path)?;
        if !self.lie_on_resize.load(Ordering::SeqCst) {
            img.virtual_size = new_size_bytes;
        }
        self.write(path, &img)
    }

    fn convert(&self, src: &Path, dst: &Path, dst_format: ImageFormat) -> ChainResult<()> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.effective(src)?;
        let img = self.read(src)?;
        self.write(
            dst,
            &FakeImage {
                format: dst_format.as_str().to_string(),
                backing_file: None,
                virtual_size: img.virtual_size,
                data,
            },
        )
    }

    fn rebase(&self, path: &Path, new_backing: Option<&Path>, mode: RebaseMode) -> ChainResult<()> {
        let mut img = self.read(path)?;
        if mode == RebaseMode::Pull {
            // Make the file self-sufficient before switching the pointer.
            img.data = self.effective(path)?;
        }
        img.backing_file = new_backing.map(|b| self.backing_ref(path, b));
        self.write(path, &img)
    }
}

struct MergeJob {
    file: PathBuf,
    polls_left: u32,
}

/// Fake host agent. Tests `attach` it to a volume's current head; live
/// snapshot and merge then mutate files the way the hypervisor would.
pub struct FakeAgent {
    ops: Arc<FakeImageOps>,
    heads: Mutex<HashMap<String, PathBuf>>,
    jobs: Mutex<HashMap<String, MergeJob>>,
    next_token: AtomicU64,
    /// Pending polls before a merge reports Done.
    pub polls_until_done: u32,
}

impl FakeAgent {
    pub fn new(ops: Arc<FakeImageOps>) -> Self {
        FakeAgent {
            ops,
            heads: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            polls_until_done: 2,
        }
    }

    pub fn attach(&self, volume: &VolumeId, head: &Path) {
        self.heads
            .lock()
            .unwrap()
            .insert(volume.as_str().to_string(), head.to_path_buf());
    }

    /// Fold `file` into its backing and rewire everything in the directory
    /// that read through it, like a hypervisor block commit.
    fn perform_merge(&self, file: &Path) -> ChainResult<()> {
        let backing_ref = self
            .ops
            .probe(file)?
            .backing_file
            .ok_or_else(|| ChainError::image_op("merge", file, "no backing file"))?;
        let parent = self.ops.resolve(file, &backing_ref);
        self.ops.commit(file)?;

        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        let dir = file.parent().unwrap();
        for entry in fs::read_dir(dir).unwrap() {
            let p = entry.unwrap().path();
            if p == *file {
                continue;
            }
            let Ok(info) = self.ops.probe(&p) else { continue };
            let backs = info
                .backing_file
                .as_deref()
                .and_then(|b| Path::new(b).file_name())
                .map(|n| n.to_string_lossy() == name)
                .unwrap_or(false);
            if backs {
                self.ops.rebase(&p, Some(&parent), RebaseMode::Pointer)?;
            }
        }
        Ok(())
    }
}

impl HypervisorAgent for FakeAgent {
    fn live_snapshot(&self, volume: &VolumeId, new_path: &Path) -> ChainResult<String> {
        let head = self
            .heads
            .lock()
            .unwrap()
            .get(volume.as_str())
            .cloned()
            .ok_or_else(|| ChainError::image_op("live_snapshot", new_path, "not attached"))?;
        self.ops.create_differencing(new_path, &head)?;
        self.attach(volume, new_path);
        Ok(new_path.file_name().unwrap().to_string_lossy().into_owned())
    }

    fn request_merge(&self, _volume: &VolumeId, file_to_merge: &Path) -> ChainResult<MergeToken> {
        let token = format!("job-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().insert(
            token.clone(),
            MergeJob {
                file: file_to_merge.to_path_buf(),
                polls_left: self.polls_until_done,
            },
        );
        Ok(MergeToken(token))
    }

    fn poll_merge(&self, token: &MergeToken) -> ChainResult<MergeStatus> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&token.0)
            .ok_or_else(|| ChainError::image_op("poll", Path::new(""), "unknown token"))?;
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(MergeStatus::Pending);
        }
        let file = job.file.clone();
        jobs.remove(&token.0);
        drop(jobs);
        self.perform_merge(&file)?;
        Ok(MergeStatus::Done)
    }
}

/// Everything one test needs: a temp dir, the fakes, and a manager wired
/// to them.
pub struct Rig {
    pub root: PathBuf,
    pub ops: Arc<FakeImageOps>,
    pub agent: Arc<FakeAgent>,
    pub mgr: snapchain::ChainManager,
}

pub fn rig(prefix: &str, cfg: snapchain::ChainConfig) -> Rig {
    init_test_logging();
    let root = unique_root(prefix);
    let ops = Arc::new(FakeImageOps::new());
    let agent = Arc::new(FakeAgent::new(Arc::clone(&ops)));
    let mgr = snapchain::ChainManager::new(ops.clone(), agent.clone(), cfg);
    Rig {
        root,
        ops,
        agent,
        mgr,
    }
}

pub fn test_config() -> snapchain::ChainConfig {
    snapchain::ChainConfig::builder()
        .lock_timeout(Some(std::time::Duration::from_secs(10)))
        .merge_poll_interval(std::time::Duration::from_millis(10))
        .merge_timeout(std::time::Duration::from_secs(5))
        .build()
}

impl Rig {
    /// Create a volume with its base image and initial metadata.
    pub fn new_volume(&self, id: &str, size: u64) -> snapchain::Volume {
        let vol = snapchain::Volume::new(id, &self.root, size, ImageFormat::Qcow2);
        self.ops
            .create_independent(&vol.dir.join(vol.base_name()), size, vol.format)
            .unwrap();
        self.mgr.init_metadata(&vol).unwrap();
        vol
    }

    pub fn active_path(&self, vol: &snapchain::Volume) -> PathBuf {
        vol.dir
            .join(snapchain::metadata::active_image(vol).unwrap())
    }

    pub fn metadata_bytes(&self, vol: &snapchain::Volume) -> Vec<u8> {
        fs::read(snapchain::metadata::metadata_path(vol)).unwrap()
    }
}

/// Agent whose merges never finish; for timeout tests.
pub struct StuckAgent;

impl HypervisorAgent for StuckAgent {
    fn live_snapshot(&self, _: &VolumeId, new_path: &Path) -> ChainResult<String> {
        Err(ChainError::image_op("live_snapshot", new_path, "stuck agent"))
    }
    fn request_merge(&self, _: &VolumeId, _: &Path) -> ChainResult<MergeToken> {
        Ok(MergeToken("stuck".to_string()))
    }
    fn poll_merge(&self, _: &MergeToken) -> ChainResult<MergeStatus> {
        Ok(MergeStatus::Pending)
    }
}

/// Agent that reports every merge as failed.
pub struct FailingAgent;

impl HypervisorAgent for FailingAgent {
    fn live_snapshot(&self, _: &VolumeId, new_path: &Path) -> ChainResult<String> {
        Err(ChainError::image_op("live_snapshot", new_path, "failing agent"))
    }
    fn request_merge(&self, _: &VolumeId, _: &Path) -> ChainResult<MergeToken> {
        Ok(MergeToken("doomed".to_string()))
    }
    fn poll_merge(&self, _: &MergeToken) -> ChainResult<MergeStatus> {
        Ok(MergeStatus::Failed("block job error".to_string()))
    }
}
