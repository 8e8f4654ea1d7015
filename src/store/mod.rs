//! Cache stores.
//!
//! A store maps chain hashes to opaque result blobs. The rewriter only relies
//! on the [`Store`] contract; the medium behind it is pluggable.

mod fs;
mod memory;

pub use self::fs::{FsConfig, FsStore, CACHE_DIR_VAR, DEFAULT_CACHE_DIR};
pub use self::memory::MemoryStore;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::cancel::Cancel;
use crate::error::StoreError;
use crate::hash::ChainHash;

/// A stored result.
pub type Blob = Arc<[u8]>;

/// The outcome of a successful [`Store::put`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Put {
    /// The entry was created.
    Written,
    /// An entry with equal content already existed.
    Unchanged,
}

/// Persists results keyed by chain hash.
///
/// # Contract
/// - `contains` must not read the full blob.
/// - `get` distinguishes an absent entry ([`StoreError::Miss`]) from one
///   that exists but cannot be read back ([`StoreError::Corrupt`]). A corrupt
///   entry is never reported as a miss.
/// - `put` is idempotent: writing equal content under an existing hash
///   returns [`Put::Unchanged`]; writing different content returns
///   [`StoreError::Collision`] and leaves the entry untouched.
/// - A partially written entry is never observable.
/// - Every call honours its [`Cancel`] token and fails with
///   [`StoreError::Timeout`] once it fired.
/// - Implementations are used from several threads at once. Calls for
///   unrelated hashes should not serialize on a single lock.
pub trait Store: Send + Sync {
    /// Whether an entry exists for the hash.
    fn contains(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError>;

    /// Read the entry for the hash.
    fn get(&self, hash: &ChainHash, cancel: &Cancel) -> Result<Blob, StoreError>;

    /// Write an entry.
    fn put(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError>;

    /// Delete an entry. Returns whether there was one.
    fn remove(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError>;

    /// Evict entries according to the policy.
    ///
    /// Stores without an eviction mechanism keep everything.
    fn evict(&self, policy: &EvictPolicy) -> Result<Evicted, StoreError> {
        let _ = policy;
        Ok(Evicted::default())
    }
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn contains(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        (**self).contains(hash, cancel)
    }

    fn get(&self, hash: &ChainHash, cancel: &Cancel) -> Result<Blob, StoreError> {
        (**self).get(hash, cancel)
    }

    fn put(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError> {
        (**self).put(hash, blob, cancel)
    }

    fn remove(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        (**self).remove(hash, cancel)
    }

    fn evict(&self, policy: &EvictPolicy) -> Result<Evicted, StoreError> {
        (**self).evict(policy)
    }
}

impl<S: Store + ?Sized> Store for &S {
    fn contains(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        (**self).contains(hash, cancel)
    }

    fn get(&self, hash: &ChainHash, cancel: &Cancel) -> Result<Blob, StoreError> {
        (**self).get(hash, cancel)
    }

    fn put(&self, hash: &ChainHash, blob: &[u8], cancel: &Cancel) -> Result<Put, StoreError> {
        (**self).put(hash, blob, cancel)
    }

    fn remove(&self, hash: &ChainHash, cancel: &Cancel) -> Result<bool, StoreError> {
        (**self).remove(hash, cancel)
    }

    fn evict(&self, policy: &EvictPolicy) -> Result<Evicted, StoreError> {
        (**self).evict(policy)
    }
}

/// Which entries to drop during eviction.
///
/// Entries older than `max_age` are dropped first. If the remaining entries
/// exceed `max_bytes`, the oldest ones are dropped until they fit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictPolicy {
    /// The maximum age of an entry.
    pub max_age: Option<Duration>,
    /// The maximum total payload size in bytes.
    pub max_bytes: Option<u64>,
}

impl EvictPolicy {
    /// A policy that drops every entry.
    pub fn all() -> Self {
        Self { max_age: None, max_bytes: Some(0) }
    }

    /// Pick the entries to drop, oldest first.
    pub(crate) fn select(&self, mut entries: Vec<EntryMeta>, now: SystemTime) -> Vec<EntryMeta> {
        entries.sort_by_key(|entry| (entry.created, entry.hash));

        let (mut doomed, kept): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| {
            self.max_age.is_some_and(|max| {
                now.duration_since(entry.created).is_ok_and(|age| age > max)
            })
        });

        if let Some(max) = self.max_bytes {
            let mut total = kept.iter().map(|entry| entry.size).sum::<u64>();
            for entry in kept {
                if total <= max {
                    break;
                }
                total -= entry.size;
                doomed.push(entry);
            }
        }

        doomed
    }
}

/// Metadata of a cache entry, sufficient for eviction decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// The entry's key.
    pub hash: ChainHash,
    /// When the entry was written.
    pub created: SystemTime,
    /// The payload size in bytes.
    pub size: u64,
}

/// The result of an eviction.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evicted {
    /// How many entries were dropped.
    pub entries: usize,
    /// How many payload bytes were freed.
    pub bytes: u64,
}

/// Pick the shard or lock stripe responsible for a hash.
///
/// The hash is uniformly distributed already, so its leading bytes are a
/// fine index.
#[inline]
pub(crate) fn stripe(hash: &ChainHash, stripes: usize) -> usize {
    let mut word = [0; 8];
    word.copy_from_slice(&hash.0[..8]);
    (u64::from_le_bytes(word) % stripes as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::identity;

    fn meta(name: &str, age: u64, size: u64, now: SystemTime) -> EntryMeta {
        EntryMeta {
            hash: identity(name).unwrap(),
            created: now - Duration::from_secs(age),
            size,
        }
    }

    #[test]
    fn test_select_by_age_then_size() {
        let now = SystemTime::now();
        let entries = vec![
            meta("fresh", 1, 10, now),
            meta("old", 100, 10, now),
            meta("middle", 50, 10, now),
        ];

        let policy = EvictPolicy { max_age: Some(Duration::from_secs(60)), max_bytes: None };
        let doomed = policy.select(entries.clone(), now);
        assert_eq!(doomed, vec![entries[1]]);

        let policy = EvictPolicy { max_age: None, max_bytes: Some(15) };
        let doomed = policy.select(entries.clone(), now);
        assert_eq!(doomed, vec![entries[1], entries[2]]);

        assert_eq!(EvictPolicy::default().select(entries.clone(), now), vec![]);
        assert_eq!(EvictPolicy::all().select(entries, now).len(), 3);
    }
}
