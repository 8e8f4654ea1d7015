use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{stripe, Blob, EntryMeta, EvictPolicy, Evicted, Put, Store};
use crate::cancel::Cancel;
use crate::error::StoreError;
use crate::hash::ChainHash;

/// The number of independently locked shards.
const SHARDS: usize = 16;

/// An in-memory store.
///
/// Entries live in a fixed number of shards, each behind its own lock, so
/// that operations on unrelated hashes rarely contend. Nothing survives the
/// process; use [`FsStore`](super::FsStore) for that.
pub struct MemoryStore {
    shards: Box<[RwLock<FxHashMap<ChainHash, Entry>>]>,
    bytes: AtomicU64,
}

/// A stored blob with its metadata.
struct Entry {
    blob: Blob,
    created: SystemTime,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(FxHashMap::default())).collect(),
            bytes: AtomicU64::new(0),
        }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total payload size in bytes.
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn shard(&self, hash: &ChainHash) -> &RwLock<FxHashMap<ChainHash, Entry>> {
        &self.shards[stripe(hash, self.shards.len())]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn contains(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        cancel.check("contains")?;
        Ok(self.shard(hash).read().contains_key(hash))
    }

    fn get(&self, hash: &ChainHash, cancel: &Cancel) -> Result<Blob, StoreError> {
        cancel.check("get")?;
        self.shard(hash)
            .read()
            .get(hash)
            .map(|entry| entry.blob.clone())
            .ok_or(StoreError::Miss { hash: *hash })
    }

    fn put(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError> {
        cancel.check("put")?;
        let mut shard = self.shard(hash).write();
        if let Some(existing) = shard.get(hash) {
            return if *existing.blob == *blob {
                Ok(Put::Unchanged)
            } else {
                Err(StoreError::Collision { hash: *hash })
            };
        }

        shard.insert(*hash, Entry { blob: Blob::from(blob), created: SystemTime::now() });
        self.bytes.fetch_add(blob.len() as u64, Ordering::SeqCst);
        Ok(Put::Written)
    }

    fn remove(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        cancel.check("remove")?;
        let removed = self.shard(hash).write().remove(hash);
        if let Some(entry) = &removed {
            self.bytes.fetch_sub(entry.blob.len() as u64, Ordering::SeqCst);
        }
        Ok(removed.is_some())
    }

    fn evict(&self, policy: &EvictPolicy) -> Result<Evicted, StoreError> {
        let entries = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(hash, entry)| EntryMeta {
                        hash: *hash,
                        created: entry.created,
                        size: entry.blob.len() as u64,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut evicted = Evicted::default();
        for meta in policy.select(entries, SystemTime::now()) {
            if self.remove(&meta.hash, &Cancel::never())? {
                evicted.entries += 1;
                evicted.bytes += meta.size;
            }
        }

        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::identity;

    #[test]
    fn test_round_trip() {
        let store = MemoryStore::new();
        let hash = identity("a").unwrap();
        let never = Cancel::never();
        assert!(!store.contains(&hash, &never).unwrap());
        assert_eq!(store.put(&hash, b"hello", &never).unwrap(), Put::Written);
        assert!(store.contains(&hash, &never).unwrap());
        assert_eq!(&*store.get(&hash, &never).unwrap(), b"hello");
        assert_eq!(store.byte_count(), 5);
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let hash = identity("a").unwrap();
        let never = Cancel::never();
        store.put(&hash, b"same", &never).unwrap();
        assert_eq!(store.put(&hash, b"same", &never).unwrap(), Put::Unchanged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.byte_count(), 4);
    }

    #[test]
    fn test_collision_keeps_original() {
        let store = MemoryStore::new();
        let hash = identity("a").unwrap();
        let never = Cancel::never();
        store.put(&hash, b"first", &never).unwrap();
        let err = store.put(&hash, b"second", &never).unwrap_err();
        assert!(matches!(err, StoreError::Collision { hash: h } if h == hash));
        assert_eq!(&*store.get(&hash, &never).unwrap(), b"first");
    }

    #[test]
    fn test_miss_is_an_error() {
        let store = MemoryStore::new();
        let hash = identity("nothing").unwrap();
        let err = store.get(&hash, &Cancel::never()).unwrap_err();
        assert!(matches!(err, StoreError::Miss { .. }));
    }

    #[test]
    fn test_cancelled_calls_fail() {
        let store = MemoryStore::new();
        let hash = identity("a").unwrap();
        let token = Cancel::new();
        token.cancel();
        assert!(matches!(store.put(&hash, b"x", &token), Err(StoreError::Timeout { op: "put" })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_evict_everything() {
        let store = MemoryStore::new();
        let never = Cancel::never();
        for i in 0..10u32 {
            store.put(&identity(&i).unwrap(), &[0; 3], &never).unwrap();
        }
        let evicted = store.evict(&EvictPolicy::all()).unwrap();
        assert_eq!(evicted, Evicted { entries: 10, bytes: 30 });
        assert!(store.is_empty());
        assert_eq!(store.byte_count(), 0);
    }
}
