//! Multi-version overlay sitting in front of [`crate::datasource::DataSource`]
//! (spec §4.G), grounded on the teacher's `storage::cache::PageCache`
//! bookkeeping, generalized from single-version LRU pages to a by-key and
//! by-path versioned row store.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::hash::Hash;
use crate::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Put,
    Delete,
    InternalHashInvalidated,
}

/// One versioned row, keyed independently by `(key, version)` and
/// `(path, version)` so both lookup directions are `O(log n)` (spec §4.G).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub version: u64,
    pub path: Path,
    pub key: Option<Vec<u8>>,
    pub op: CacheOp,
    pub value: Option<Vec<u8>>,
    pub hash: Option<Hash>,
}

/// The in-memory overlay of not-yet-flushed versions. `mark_mutable`/`seal`
/// bracket the version currently accepting writes — `VirtualMap::open`/`copy`
/// call `mark_mutable` as each new version takes over, and the pipeline calls
/// `seal` once a version's dirty set is fully hashed. The `RwLock` guarding
/// both maps already provides the happens-before a sealed version's reader
/// needs to observe every write made while it was mutable, so `seal`'s fence
/// just documents that guarantee rather than replacing it; `mutable_version`
/// is advisory bookkeeping for spec §4.G's "exactly one mutable version"
/// rule, not an enforced guard — `VirtualMap`'s `CopyState` is what actually
/// rejects writes against a sealed copy.
pub struct VersionedCache {
    by_key: RwLock<BTreeMap<(Vec<u8>, u64), CacheEntry>>,
    by_path: RwLock<BTreeMap<(u64, u64), CacheEntry>>,
    mutable_version: AtomicU64,
}

impl VersionedCache {
    pub fn new() -> Self {
        Self {
            by_key: RwLock::new(BTreeMap::new()),
            by_path: RwLock::new(BTreeMap::new()),
            mutable_version: AtomicU64::new(0),
        }
    }

    pub fn mark_mutable(&self, version: u64) {
        self.mutable_version.store(version, Ordering::Release);
    }

    pub fn mutable_version(&self) -> u64 {
        self.mutable_version.load(Ordering::Acquire)
    }

    pub fn put_leaf(&self, version: u64, path: Path, key: Vec<u8>, value: Vec<u8>, hash: Option<Hash>) {
        let entry = CacheEntry {
            version,
            path,
            key: Some(key.clone()),
            op: CacheOp::Put,
            value: Some(value),
            hash,
        };
        self.by_key.write().insert((key, version), entry.clone());
        self.by_path.write().insert((path.get(), version), entry);
    }

    pub fn delete_leaf(&self, version: u64, path: Path, key: Vec<u8>) {
        let entry = CacheEntry {
            version,
            path,
            key: Some(key.clone()),
            op: CacheOp::Delete,
            value: None,
            hash: None,
        };
        self.by_key.write().insert((key, version), entry.clone());
        self.by_path.write().insert((path.get(), version), entry);
    }

    /// Tombstone a path that no longer holds a leaf because it was just
    /// promoted to an internal node by a split (spec §3's growth rule). Does
    /// not touch the by-key index: the leaf that used to live here has
    /// already been re-pointed to its new path by a separate `put_leaf`.
    pub fn vacate_leaf(&self, version: u64, path: Path) {
        let entry = CacheEntry {
            version,
            path,
            key: None,
            op: CacheOp::Delete,
            value: None,
            hash: None,
        };
        self.by_path.write().insert((path.get(), version), entry);
    }

    pub fn invalidate_internal(&self, version: u64, path: Path, hash: Hash) {
        let entry = CacheEntry {
            version,
            path,
            key: None,
            op: CacheOp::InternalHashInvalidated,
            value: None,
            hash: Some(hash),
        };
        self.by_path.write().insert((path.get(), version), entry);
    }

    /// The latest row for `key` at a version `<= version`, if any.
    pub fn lookup_by_key(&self, key: &[u8], version: u64) -> Option<CacheEntry> {
        let map = self.by_key.read();
        map.range((key.to_vec(), 0)..=(key.to_vec(), version))
            .next_back()
            .map(|(_, entry)| entry.clone())
    }

    /// The latest row for `path` at a version `<= version`, if any.
    pub fn lookup_by_path(&self, path: Path, version: u64) -> Option<CacheEntry> {
        let map = self.by_path.read();
        map.range((path.get(), 0)..=(path.get(), version))
            .next_back()
            .map(|(_, entry)| entry.clone())
    }

    /// Publish everything written under `version`, establishing the
    /// happens-before a concurrent `Hashing`-stage reader of the same
    /// version relies on.
    pub fn seal(&self, _version: u64) {
        fence(Ordering::Release);
    }

    /// Drop every row at or below `version`, once its flush has landed on
    /// disk and readers can fall through to [`crate::datasource::DataSource`]
    /// instead.
    pub fn release_up_to(&self, version: u64) {
        self.by_key.write().retain(|(_, v), _| *v > version);
        self.by_path.write().retain(|(_, v), _| *v > version);
    }

    /// Remove and return every row at or below `version` from the by-path
    /// index, and drop their by-key counterparts. Used by the pipeline to
    /// gather a flush's worth of rows to persist (spec §4.I).
    pub fn drain_up_to(&self, version: u64) -> Vec<CacheEntry> {
        let mut by_path = self.by_path.write();
        let keys: Vec<(u64, u64)> = by_path
            .iter()
            .filter(|(_, e)| e.version <= version)
            .map(|(k, _)| *k)
            .collect();
        let mut drained = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(entry) = by_path.remove(&k) {
                drained.push(entry);
            }
        }
        drop(by_path);
        self.by_key.write().retain(|(_, v), _| *v > version);
        drained
    }

    pub fn len(&self) -> usize {
        self.by_path.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VersionedCache {
    fn default() -> Self {
        Self::new()
    }
}
