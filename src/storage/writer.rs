use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::{BlobKey, BlobStore};

/// A snapshot staged under the policy lock, written after it is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub key: BlobKey,
    /// `None` deletes the blob
    pub blob: Option<Vec<u8>>,
    pub generation: u64,
}

/// Orders blob writes made outside the policy lock.
///
/// Writes are stamped with a generation while the lock is held. A write whose
/// generation is older than the last one committed for its key is dropped, so
/// a slow writer never replaces newer state with an older snapshot.
#[derive(Default)]
pub struct OrderedWriter {
    next_generation: AtomicU64,
    committed: Mutex<HashMap<BlobKey, u64>>,
}

impl OrderedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a write. Call with the policy lock held.
    pub fn stage(&self, key: BlobKey, blob: Option<Vec<u8>>) -> PendingWrite {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        PendingWrite {
            key,
            blob,
            generation,
        }
    }

    /// Persist `write` unless a newer one for the same key already landed.
    /// Returns whether the write reached the store.
    pub fn commit(&self, store: &dyn BlobStore, write: &PendingWrite) -> Result<bool> {
        let mut committed = self
            .committed
            .lock()
            .map_err(|_| anyhow::anyhow!("Writer generation table poisoned"))?;

        let last = committed.get(&write.key).copied().unwrap_or(0);
        if write.generation <= last {
            debug!(
                "Skipping stale write of {} (generation {} <= {})",
                write.key.file_name(),
                write.generation,
                last
            );
            return Ok(false);
        }

        let result = match &write.blob {
            Some(blob) => store.store(write.key, blob),
            None => store.delete(write.key),
        };
        result.with_context(|| format!("Failed to persist {}", write.key.file_name()))?;

        committed.insert(write.key, write.generation);
        Ok(true)
    }

    /// Commit every write, continuing past failures. Returns the first error.
    pub fn commit_all(&self, store: &dyn BlobStore, writes: &[PendingWrite]) -> Result<()> {
        let mut first_error = None;
        for write in writes {
            if let Err(e) = self.commit(store, write) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn stale_write_is_skipped() {
        let store = MemoryBlobStore::new();
        let writer = OrderedWriter::new();

        let older = writer.stage(BlobKey::User(0), Some(b"old".to_vec()));
        let newer = writer.stage(BlobKey::User(0), Some(b"new".to_vec()));

        assert!(writer.commit(&store, &newer).unwrap());
        assert!(!writer.commit(&store, &older).unwrap());
        assert_eq!(store.load(BlobKey::User(0)).unwrap().unwrap(), b"new");
    }

    #[test]
    fn generations_are_per_key() {
        let store = MemoryBlobStore::new();
        let writer = OrderedWriter::new();

        let user = writer.stage(BlobKey::User(0), Some(b"user".to_vec()));
        let owners = writer.stage(BlobKey::Owners, Some(b"owners".to_vec()));

        assert!(writer.commit(&store, &owners).unwrap());
        assert!(writer.commit(&store, &user).unwrap());
    }

    #[test]
    fn failed_write_can_be_retried() {
        let store = MemoryBlobStore::new();
        let writer = OrderedWriter::new();
        let write = writer.stage(BlobKey::Owners, Some(b"x".to_vec()));

        store.fail_after(0);
        assert!(writer.commit(&store, &write).is_err());

        store.heal();
        assert!(writer.commit(&store, &write).unwrap());
    }

    #[test]
    fn delete_write_removes_blob() {
        let store = MemoryBlobStore::new();
        let writer = OrderedWriter::new();

        writer
            .commit_all(
                &store,
                &[
                    writer.stage(BlobKey::TransferJournal, Some(b"j".to_vec())),
                    writer.stage(BlobKey::TransferJournal, None),
                ],
            )
            .unwrap();
        assert!(!store.contains(BlobKey::TransferJournal));
    }
}
