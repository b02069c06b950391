/// Durable storage for policy state
///
/// State is kept as a handful of independent blobs: one per user, one for
/// the owner registry and a transient transfer journal. Each blob is replaced
/// atomically so a reader sees either the old or the new content.
pub mod snapshot;
pub mod writer;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::UserId;
use crate::platform::common::{atomic_write, ensure_directory_exists, sync_directory};

pub use snapshot::{SNAPSHOT_VERSION, decode_snapshot, encode_snapshot};
pub use writer::{OrderedWriter, PendingWrite};

/// Identifies one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobKey {
    User(UserId),
    Owners,
    TransferJournal,
}

impl BlobKey {
    pub fn file_name(&self) -> String {
        match self {
            BlobKey::User(id) => format!("user_{}.json", id),
            BlobKey::Owners => "owners.json".to_string(),
            BlobKey::TransferJournal => "transfer-journal.json".to_string(),
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "owners.json" => Some(BlobKey::Owners),
            "transfer-journal.json" => Some(BlobKey::TransferJournal),
            _ => name
                .strip_prefix("user_")?
                .strip_suffix(".json")?
                .parse()
                .ok()
                .map(BlobKey::User),
        }
    }
}

/// Key-value blob persistence
pub trait BlobStore: Send + Sync {
    fn load(&self, key: BlobKey) -> Result<Option<Vec<u8>>>;

    /// Replace the blob; durable once this returns
    fn store(&self, key: BlobKey, blob: &[u8]) -> Result<()>;

    /// Remove the blob; removing a missing blob succeeds
    fn delete(&self, key: BlobKey) -> Result<()>;

    /// Keys currently present
    fn keys(&self) -> Result<Vec<BlobKey>>;
}

/// Get the default state directory
pub fn default_state_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/var/lib/device-policy");
        if system_path.exists() {
            return Ok(system_path);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "device-policy") {
        return Ok(dirs.data_local_dir().to_path_buf());
    }

    anyhow::bail!("Could not determine state directory");
}

/// Blobs as files in one directory
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_directory_exists(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: BlobKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, key: BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }

        let blob = std::fs::read(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        Ok(Some(blob))
    }

    fn store(&self, key: BlobKey, blob: &[u8]) -> Result<()> {
        let path = self.path(key);
        atomic_write(&path, blob)
            .with_context(|| format!("Failed to write state file: {}", path.display()))
    }

    fn delete(&self, key: BlobKey) -> Result<()> {
        let path = self.path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete state file: {}", path.display()))?;
            sync_directory(&self.root)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<BlobKey>> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list state directory: {}", self.root.display()))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.context("Failed to read state directory entry")?;
            if let Some(key) = entry.file_name().to_str().and_then(BlobKey::from_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory blobs, with optional fault injection for crash tests
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: BTreeMap<BlobKey, Vec<u8>>,
    /// Writes (stores and deletes) still allowed before every write fails
    writes_left: Option<usize>,
    writes_done: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `writes` more writes succeed, then fail every write as if the
    /// process had died
    pub fn fail_after(&self, writes: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.writes_left = Some(writes);
        }
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.writes_left = None;
        }
    }

    pub fn contains(&self, key: BlobKey) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.blobs.contains_key(&key))
            .unwrap_or(false)
    }

    fn write<F>(&self, key: BlobKey, apply: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<BlobKey, Vec<u8>>),
    {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;

        if let Some(left) = inner.writes_left.as_mut() {
            if *left == 0 {
                anyhow::bail!("Injected write failure for {}", key.file_name());
            }
            *left -= 1;
        }

        apply(&mut inner.blobs);
        inner.writes_done += 1;
        Ok(())
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.writes_done)
            .unwrap_or(0)
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: BlobKey) -> Result<Option<Vec<u8>>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(inner.blobs.get(&key).cloned())
    }

    fn store(&self, key: BlobKey, blob: &[u8]) -> Result<()> {
        self.write(key, |blobs| {
            blobs.insert(key, blob.to_vec());
        })
    }

    fn delete(&self, key: BlobKey) -> Result<()> {
        self.write(key, |blobs| {
            blobs.remove(&key);
        })
    }

    fn keys(&self) -> Result<Vec<BlobKey>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(inner.blobs.keys().copied().collect())
    }
}
