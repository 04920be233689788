//! The public, versioned, copy-on-write map (spec §4.H), grounded on the
//! teacher's `PersistentMerkleTree` public surface (`append`/`update`/`root`/`sync`)
//! generalized to arbitrary keys and an explicit multi-version lineage.
//!
//! Leaf placement follows the standard full-binary-tree growth rule: with
//! `n` leaves the tree always has exactly `2n - 1` nodes, numbered breadth
//! first, so the leaves are always the top `n` paths (`first_leaf_path = n - 1`,
//! `last_leaf_path = 2n - 2`). Growing from `n` to `n + 1` leaves therefore
//! always splits the current leftmost leaf (`path = n - 1`) into an internal
//! node: its record moves to its left child and the new key takes the right
//! child. Removing a leaf runs that in reverse (see DESIGN.md).

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::{CacheOp, VersionedCache};
use crate::config::VirtualMapConfig;
use crate::datasource::{DataSource, TreeState};
use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::hash::{self, Hash};
use crate::path::{self, Path};
use crate::pipeline::{Pipeline, SealedCopy};

/// Lifecycle state of one `VirtualMap` handle (spec §9's "Archivable"
/// redesign): `Mutable` accepts `put`/`remove`; `copy()` demotes it to
/// `Immutable` (still readable); `archive()` further demotes an `Immutable`
/// copy no longer expected to be read often; `release()` forbids all access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Mutable,
    Immutable,
    Released,
    ArchivedReadOnly,
}

struct Inner {
    source: Arc<DataSource>,
    cache: Arc<VersionedCache>,
    pipeline: Pipeline,
    config: VirtualMapConfig,
}

/// One versioned, copy-on-write view of the map. Every `VirtualMap<K, V>`
/// produced by repeated `copy()` calls shares the same underlying
/// [`DataSource`]/[`VersionedCache`]/[`Pipeline`] but has its own version
/// number, `TreeState`, dirty set, and lifecycle state.
pub struct VirtualMap<K, V> {
    inner: Arc<Inner>,
    version: u64,
    state: Arc<RwLock<TreeState>>,
    dirty: Arc<Mutex<Vec<Path>>>,
    copy_state: Arc<RwLock<CopyState>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Clone for VirtualMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            version: self.version,
            state: self.state.clone(),
            dirty: self.dirty.clone(),
            copy_state: self.copy_state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> VirtualMap<K, V>
where
    K: AsRef<[u8]> + Clone,
    V: AsRef<[u8]> + Clone + From<Vec<u8>>,
{
    /// Open (or create) a map rooted at `config.data_dir`, recovering
    /// whatever `TreeState` was last durably committed.
    pub fn open(config: VirtualMapConfig) -> VirtualMapResult<Self> {
        config.validate()?;
        let source = Arc::new(DataSource::open(&config)?);
        let cache = Arc::new(VersionedCache::new());
        let state = source.state();
        let pipeline = Pipeline::new(config.clone(), source.clone(), cache.clone());
        cache.mark_mutable(1);

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                cache,
                pipeline,
                config,
            }),
            version: 1,
            state: Arc::new(RwLock::new(state)),
            dirty: Arc::new(Mutex::new(Vec::new())),
            copy_state: Arc::new(RwLock::new(CopyState::Mutable)),
            _marker: PhantomData,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> TreeState {
        self.state.read().clone()
    }

    pub fn copy_state(&self) -> CopyState {
        *self.copy_state.read()
    }

    fn ensure_mutable(&self) -> VirtualMapResult<()> {
        match *self.copy_state.read() {
            CopyState::Mutable => Ok(()),
            CopyState::Released => Err(VirtualMapError::ReleasedState),
            CopyState::Immutable | CopyState::ArchivedReadOnly => {
                Err(VirtualMapError::ImmutableState)
            }
        }
    }

    fn ensure_not_released(&self) -> VirtualMapResult<()> {
        if *self.copy_state.read() == CopyState::Released {
            Err(VirtualMapError::ReleasedState)
        } else {
            Ok(())
        }
    }

    fn lookup_path_for_key(&self, key: &[u8]) -> VirtualMapResult<Option<Path>> {
        if let Some(entry) = self.inner.cache.lookup_by_key(key, self.version) {
            return Ok(match entry.op {
                CacheOp::Delete => None,
                _ => Some(entry.path),
            });
        }
        Ok(self
            .inner
            .source
            .find_leaf_by_key(key)?
            .map(|leaf| leaf.path))
    }

    fn read_leaf(&self, path: Path) -> VirtualMapResult<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(entry) = self.inner.cache.lookup_by_path(path, self.version) {
            return Ok(match entry.op {
                CacheOp::Delete => None,
                _ => Some((entry.key.unwrap_or_default(), entry.value.unwrap_or_default())),
            });
        }
        Ok(self
            .inner
            .source
            .find_leaf_by_path(path)?
            .map(|leaf| (leaf.key, leaf.value)))
    }

    fn write_leaf(&self, path: Path, key: Vec<u8>, value: Vec<u8>) {
        let mut buf = key.clone();
        buf.extend_from_slice(&value);
        let hash = hash::hash_bytes(self.inner.config.digest, &buf);
        self.inner
            .cache
            .put_leaf(self.version, path, key, value, Some(hash));
        self.dirty.lock().push(path);
    }

    fn delete_leaf_full(&self, path: Path, key: Vec<u8>) {
        self.inner.cache.delete_leaf(self.version, path, key);
    }

    /// Read a value by key. Works on any non-released copy, mutable or not.
    pub fn get(&self, key: &K) -> VirtualMapResult<Option<V>> {
        self.ensure_not_released()?;
        let key_bytes = key.as_ref();
        if let Some(entry) = self.inner.cache.lookup_by_key(key_bytes, self.version) {
            return Ok(match entry.op {
                CacheOp::Delete => None,
                _ => entry.value.map(V::from),
            });
        }
        Ok(self
            .inner
            .source
            .find_leaf_by_key(key_bytes)?
            .map(|leaf| V::from(leaf.value)))
    }

    /// Like `get`, but only valid on a `Mutable` copy (spec §4.H: signals
    /// intent to follow up with a `put`).
    pub fn get_for_modify(&self, key: &K) -> VirtualMapResult<Option<V>> {
        self.ensure_mutable()?;
        self.get(key)
    }

    /// Insert or update `key`. Existing keys are updated in place (their
    /// leaf path never changes); a brand-new key grows the tree per the
    /// module doc's split rule.
    pub fn put(&self, key: K, value: V) -> VirtualMapResult<()> {
        self.ensure_mutable()?;
        let key_bytes = key.as_ref().to_vec();
        let value_bytes = value.as_ref().to_vec();

        if let Some(existing_path) = self.lookup_path_for_key(&key_bytes)? {
            self.write_leaf(existing_path, key_bytes, value_bytes);
            return Ok(());
        }

        let mut state = self.state.write();
        let n = state.size;
        if n == 0 {
            self.write_leaf(Path::ROOT, key_bytes, value_bytes);
            state.size = 1;
            state.first_leaf_path = 0;
            state.last_leaf_path = 0;
        } else {
            let old_first = Path::new(n - 1);
            let relocated_path = path::left_child(old_first)?;
            let new_path = path::right_child(old_first)?;
            if let Some((old_key, old_value)) = self.read_leaf(old_first)? {
                self.write_leaf(relocated_path, old_key, old_value);
            }
            self.inner.cache.vacate_leaf(self.version, old_first);
            self.write_leaf(new_path, key_bytes, value_bytes);
            state.size = n + 1;
            state.first_leaf_path = n as i64;
            state.last_leaf_path = (2 * n) as i64;
        }
        Ok(())
    }

    /// Remove `key`, compacting the tree by swapping the current last leaf
    /// into the vacated slot and folding the last sibling pair back into
    /// their parent (the reverse of `put`'s split).
    pub fn remove(&self, key: &K) -> VirtualMapResult<Option<V>> {
        self.ensure_mutable()?;
        let key_bytes = key.as_ref();
        let path = match self.lookup_path_for_key(key_bytes)? {
            Some(p) => p,
            None => {
                return if self.inner.config.remove_missing_is_error {
                    Err(VirtualMapError::NotFound)
                } else {
                    Ok(None)
                };
            }
        };
        let existing = self.read_leaf(path)?.map(|(_, v)| V::from(v));

        let mut state = self.state.write();
        let n = state.size;
        if n == 1 {
            self.delete_leaf_full(path, key_bytes.to_vec());
            state.size = 0;
            state.first_leaf_path = -1;
            state.last_leaf_path = -1;
        } else {
            let last = Path::new(2 * n - 2);
            let sibling_of_last = path::sibling(last)?;
            let parent_of_last = path::parent(last)?;

            if path == sibling_of_last {
                // The removed leaf is already `last`'s sibling: folding that
                // pair's parent collapses directly onto `last`'s data, and
                // `path` itself disappears rather than being swapped into.
                self.delete_leaf_full(path, key_bytes.to_vec());
                if let Some((last_key, last_value)) = self.read_leaf(last)? {
                    self.write_leaf(parent_of_last, last_key, last_value);
                }
                self.inner.cache.vacate_leaf(self.version, last);
            } else {
                if path == last {
                    self.delete_leaf_full(path, key_bytes.to_vec());
                } else {
                    if let Some((last_key, last_value)) = self.read_leaf(last)? {
                        self.write_leaf(path, last_key, last_value);
                    }
                    self.inner.cache.vacate_leaf(self.version, last);
                }

                if let Some((sib_key, sib_value)) = self.read_leaf(sibling_of_last)? {
                    self.write_leaf(parent_of_last, sib_key, sib_value);
                }
                self.inner.cache.vacate_leaf(self.version, sibling_of_last);
            }

            let new_size = n - 1;
            state.size = new_size;
            state.first_leaf_path = (new_size as i64) - 1;
            state.last_leaf_path = 2 * (new_size as i64) - 2;
        }
        Ok(existing)
    }

    /// Seal this copy (making it `Immutable`) and return a fresh `Mutable`
    /// copy for the next version. The sealed copy is handed to the pipeline
    /// for hashing and eventual merge/flush (spec §4.H/§4.I).
    pub fn copy(&self) -> VirtualMapResult<Self> {
        self.ensure_mutable()?;
        *self.copy_state.write() = CopyState::Immutable;

        let dirty = std::mem::take(&mut *self.dirty.lock());
        let state_snapshot = self.state.read().clone();

        // Exactly one version accepts writes at a time (spec §4.G): this
        // copy stops being that version the moment it's sealed, and the
        // freshly returned handle becomes the new one.
        self.inner.cache.mark_mutable(self.version + 1);

        self.inner.pipeline.submit(SealedCopy {
            version: self.version,
            dirty_leaves: dirty,
            state: state_snapshot.clone(),
        })?;

        Ok(Self {
            inner: self.inner.clone(),
            version: self.version + 1,
            state: Arc::new(RwLock::new(state_snapshot)),
            dirty: Arc::new(Mutex::new(Vec::new())),
            copy_state: Arc::new(RwLock::new(CopyState::Mutable)),
            _marker: PhantomData,
        })
    }

    /// Forbid all further access to this copy (spec §4.H).
    pub fn release(&self) {
        *self.copy_state.write() = CopyState::Released;
    }

    /// Demote an `Immutable` copy to `ArchivedReadOnly`, signaling it is
    /// expected to be read rarely (spec §9's "Archivable" redesign).
    pub fn archive(&self) -> VirtualMapResult<()> {
        let mut guard = self.copy_state.write();
        match *guard {
            CopyState::Immutable => {
                *guard = CopyState::ArchivedReadOnly;
                Ok(())
            }
            CopyState::Released => Err(VirtualMapError::ReleasedState),
            CopyState::Mutable | CopyState::ArchivedReadOnly => {
                Err(VirtualMapError::ImmutableState)
            }
        }
    }

    /// Block until this copy's version has been durably flushed (spec §5).
    pub fn wait_until_flushed(&self) -> VirtualMapResult<()> {
        self.inner.pipeline.wait_until_flushed(self.version)
    }

    /// The current root hash, consulting the in-flight cache first and
    /// falling back to whatever has already landed on disk. A copy's own
    /// `TreeState` snapshot is taken at `copy()` time and never updated in
    /// place, so this always re-derives the answer rather than trusting it.
    pub fn root_hash(&self) -> VirtualMapResult<Hash> {
        if self.state.read().is_empty() {
            return Ok(hash::empty_tree_root(self.inner.config.digest));
        }
        if let Some(entry) = self.inner.cache.lookup_by_path(Path::ROOT, self.version) {
            if let Some(h) = entry.hash {
                return Ok(h);
            }
        }
        if let Some(h) = self.inner.source.find_internal_hash(Path::ROOT)? {
            return Ok(h);
        }
        if let Some(leaf) = self.inner.source.find_leaf_by_path(Path::ROOT)? {
            if let Some(h) = leaf.hash {
                return Ok(h);
            }
        }
        Ok(hash::empty_tree_root(self.inner.config.digest))
    }

    pub fn pipeline_queue_depth(&self) -> usize {
        self.inner.pipeline.queue_depth()
    }

    /// Hard-link (or copy) every durable file into `directory` (spec §4.F).
    pub fn snapshot(&self, directory: impl Into<PathBuf>) -> VirtualMapResult<()> {
        self.inner.source.snapshot(directory)
    }

    /// Fold a bounded prefix of sealed leaf-index files together, dropping
    /// superseded records (spec §4.D, exposed for callers that want to drive
    /// compaction on their own schedule rather than a background thread).
    pub fn merge_leaves(&self) -> VirtualMapResult<usize> {
        self.inner.source.merge_leaves(
            self.inner.config.merge_max_files,
            self.inner.config.merge_target_bytes,
        )
    }

    pub fn merge_internals(&self) -> VirtualMapResult<usize> {
        self.inner.source.merge_internals(
            self.inner.config.merge_max_files,
            self.inner.config.merge_target_bytes,
        )
    }

    pub fn compact_key_to_path(&self) -> VirtualMapResult<()> {
        self.inner.source.compact_key_to_path()
    }
}
