//! Content-addressed cache of phase outputs.
//!
//! Every phase boundary is a cache boundary. A phase's key chains the key of
//! the previous phase (or of the parent layer) with the phase name, the
//! ordered features and the resolved package transaction, so a change
//! anywhere upstream invalidates everything after it. Inputs read from
//! outside the image (install and tarball sources, cloned layers, chef
//! attribute files) are hashed by content.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index/<key>.json            phase outcome + snapshot reference
//! blobs/sha256/<xx>/<sha256>  deterministic tar.zst of the image root
//! locks/<key>.lock            per-key build lock
//! tmp/                        staging for atomic writes
//! ```

mod archive;

use crate::compiler::Transaction;
use crate::feature::{self, Feature, FeatureData};
use crate::layer::{Layer, PhaseOutcome};
use crate::phase::Phase;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Bumped whenever the key derivation or entry format changes.
const KEY_VERSION: &str = "layer-compiler-phase-cache-v2";

/// What a phase reads besides its feature data.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyInputs<'a> {
    /// Base of relative `install_files` and `tarball` sources.
    pub sources_dir: Option<&'a Path>,
    /// Layers `clone` features copy from, by label.
    pub dependencies: Option<&'a BTreeMap<String, Layer>>,
}

/// Reference to a stored root snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub blob_sha256: String,
    pub size_bytes: u64,
}

/// Index entry for one cached phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub phase: Phase,
    pub layer_label: String,
    pub order: Vec<String>,
    pub outcome: PhaseOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
    pub stored_at_unix: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub index_entries: u64,
    pub referenced_blobs: u64,
    pub referenced_bytes: u64,
}

/// Phase cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct PhaseCache {
    root: PathBuf,
}

impl PhaseCache {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        cache.ensure_layout()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.blobs_dir().join("sha256"),
            self.index_dir(),
            self.tmp_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn index_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.index_dir().join(format!("{}.json", key)))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            bail!("invalid sha256: {sha256}");
        }
        Ok(self
            .blobs_dir()
            .join("sha256")
            .join(&sha256[0..2])
            .join(sha256))
    }

    /// Key every build on top of `parent` starts from.
    pub fn seed_key(parent: &Layer) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION.as_bytes());
        hasher.update(serde_json::to_vec(parent).context("Failed to serialize parent layer")?);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Key of a phase given the key of the phase before it.
    pub fn phase_key<'a>(
        previous: &str,
        phase: Phase,
        features: impl IntoIterator<Item = &'a Feature>,
        transaction: Option<&Transaction>,
        inputs: &KeyInputs<'_>,
    ) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION.as_bytes());
        hasher.update([0]);
        hasher.update(previous.as_bytes());
        hasher.update([0]);
        hasher.update(phase.as_str().as_bytes());
        for feature in features {
            hasher.update([0]);
            hasher.update(serde_json::to_vec(&feature.data).context("Failed to hash feature")?);
            hash_inputs(&mut hasher, &feature.data, inputs)
                .with_context(|| format!("Failed to hash inputs of {}", feature.origin_label))?;
        }
        if let Some(transaction) = transaction {
            hasher.update([1]);
            hasher.update(serde_json::to_vec(transaction).context("Failed to hash transaction")?);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.index_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read index {}", path.display()))?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse index {}", path.display()))?;
        if let Some(snapshot) = &entry.snapshot {
            if !self.blob_path(&snapshot.blob_sha256)?.exists() {
                tracing::warn!(key, "cache entry references a missing snapshot, ignoring");
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    /// Store a phase outcome, snapshotting `root` if given. The caller is
    /// expected to hold [`PhaseCache::lock`] for `entry.key`.
    pub fn store(&self, mut entry: CacheEntry, root: Option<&Path>) -> Result<CacheEntry> {
        validate_key(&entry.key)?;
        if let Some(root) = root {
            let tmp_tar = self.tmp_dir().join(tmp_name("snapshot.tar.zst"));
            archive::create_tar_zst(root, &tmp_tar)?;
            let (sha256, size_bytes) = sha256_file(&tmp_tar)?;
            let blob_path = self.blob_path(&sha256)?;
            if blob_path.exists() {
                let _ = fs::remove_file(&tmp_tar);
            } else {
                atomic_rename(&tmp_tar, &blob_path)?;
            }
            entry.snapshot = Some(SnapshotRef {
                blob_sha256: sha256,
                size_bytes,
            });
        }
        entry.stored_at_unix = now_unix();

        let path = self.index_path(&entry.key)?;
        let tmp = self.tmp_dir().join(tmp_name("index.json"));
        fs::write(&tmp, serde_json::to_vec_pretty(&entry)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        atomic_rename(&tmp, &path)?;
        tracing::debug!(key = %entry.key, phase = %entry.phase, "stored phase");
        Ok(entry)
    }

    /// Replace `root` with the snapshot of `entry`.
    pub fn restore(&self, entry: &CacheEntry, root: &Path) -> Result<()> {
        let Some(snapshot) = &entry.snapshot else {
            bail!("cache entry {} has no snapshot", entry.key);
        };
        let blob = self.blob_path(&snapshot.blob_sha256)?;
        let (actual, _) = sha256_file(&blob)?;
        if actual != snapshot.blob_sha256 {
            bail!(
                "Blob hash mismatch for {}\n  expected: {}\n  actual:   {}",
                entry.key,
                snapshot.blob_sha256,
                actual
            );
        }
        archive::materialize_tar_zst_dir(&blob, root)
    }

    /// Take the build lock for `key`. Fails immediately if another process
    /// holds it.
    pub fn lock(&self, key: &str) -> Result<CacheLock> {
        validate_key(key)?;
        let lock_path = self.locks_dir().join(format!("{}.lock", key));
        // Never unlink a lock file that may still be held; a new file at the
        // same path would hand out a second exclusive lock.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "phase {} is being built by another process ({})",
                key,
                lock_path.display()
            );
        }
        Ok(CacheLock {
            _file: file,
            path: lock_path,
        })
    }

    /// Remove blobs that no index entry references.
    pub fn gc(&self) -> Result<usize> {
        let referenced = self.referenced_blobs()?;
        let mut removed = 0usize;
        for ent in WalkDir::new(self.blobs_dir().join("sha256"))
            .into_iter()
            .filter_map(Result::ok)
        {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).with_context(|| {
                format!("Failed to remove unreferenced blob {}", ent.path().display())
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Drop index entries older than the newest `keep_last`.
    pub fn prune_keep_last(&self, keep_last: usize) -> Result<usize> {
        if keep_last == 0 {
            bail!("keep_last must be >= 1");
        }
        let mut entries = self.entries()?;
        entries.sort_by(|a, b| b.stored_at_unix.cmp(&a.stored_at_unix));
        let mut removed = 0usize;
        for entry in entries.into_iter().skip(keep_last) {
            fs::remove_file(self.index_path(&entry.key)?)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let referenced = self.referenced_blobs()?;
        let mut referenced_blobs = 0u64;
        let mut referenced_bytes = 0u64;
        for sha in &referenced {
            if let Ok(md) = fs::metadata(self.blob_path(sha)?) {
                referenced_blobs += 1;
                referenced_bytes += md.len();
            }
        }
        Ok(CacheStatus {
            root: self.root.clone(),
            index_entries: self.entries()?.len() as u64,
            referenced_blobs,
            referenced_bytes,
        })
    }

    /// Every readable index entry. Unparseable entries are skipped.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut out = Vec::new();
        for ent in fs::read_dir(self.index_dir())
            .with_context(|| format!("Failed to read {}", self.index_dir().display()))?
        {
            let path = ent?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => out.push(entry),
                Err(e) => tracing::warn!("skipping unreadable index {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    fn referenced_blobs(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|e| e.snapshot.map(|s| s.blob_sha256))
            .filter(|s| is_hex_64(s))
            .collect())
    }
}

/// RAII guard: unlocks on drop.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_err() {
        // EXDEV and friends.
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        fs::remove_file(src).with_context(|| format!("Failed to remove tmp {}", src.display()))?;
    }
    Ok(())
}

fn hash_inputs(hasher: &mut Sha256, data: &FeatureData, inputs: &KeyInputs<'_>) -> Result<()> {
    match data {
        FeatureData::InstallFiles(i) => {
            hash_source(hasher, &feature::source_path(&i.source, inputs.sources_dir))
        }
        FeatureData::Tarball(t) => {
            hash_source(hasher, &feature::source_path(&t.source, inputs.sources_dir))
        }
        FeatureData::Clone(c) => {
            match inputs.dependencies.and_then(|deps| deps.get(&c.src_layer)) {
                Some(layer) => hasher.update(serde_json::to_vec(layer)?),
                None => hasher.update(b"missing"),
            }
            Ok(())
        }
        // Relative attribute files live in the image, which the chain covers.
        FeatureData::Chef(c) => match &c.json_attributes {
            Some(attrs) if attrs.is_absolute() => hash_source(hasher, attrs),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Hash a host file or directory tree: names, types, modes, contents and
/// link targets, in name order.
fn hash_source(hasher: &mut Sha256, path: &Path) -> Result<()> {
    hasher.update([2]);
    if let Err(e) = fs::metadata(path) {
        if e.kind() == std::io::ErrorKind::NotFound {
            hasher.update(b"missing");
            return Ok(());
        }
        return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
    }
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let md = if entry.depth() == 0 {
            fs::metadata(entry.path())?
        } else {
            entry.metadata()?
        };
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        hasher.update(rel.as_os_str().as_bytes());
        hasher.update([0]);
        hasher.update((md.permissions().mode() & 0o7777).to_le_bytes());
        if md.file_type().is_symlink() {
            hasher.update(b"l");
            hasher.update(fs::read_link(entry.path())?.as_os_str().as_bytes());
        } else if md.is_dir() {
            hasher.update(b"d");
        } else {
            let (sha256, _) = sha256_file(entry.path())?;
            hasher.update(b"f");
            hasher.update(sha256.as_bytes());
        }
        hasher.update([0]);
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn validate_key(key: &str) -> Result<()> {
    if !is_hex_64(key) {
        bail!("cache key must be a sha256 hex digest: {key}");
    }
    Ok(())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
