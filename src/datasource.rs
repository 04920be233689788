//! Composition of the on-disk primitives into one key/path-addressable
//! source of truth (spec §4.F), grounded on the teacher's
//! `PersistentMerkleTree`, which composes a metadata file with leaf/node
//! storage behind one facade.

use std::fs;
use std::io::Read as _;
use std::path::{Path as FsPath, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::VirtualMapConfig;
use crate::datastore::{Hdhm, PathIndex, PauseGate};
use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::hash::Hash;
use crate::path::Path;
use crate::wire;

/// Tree-wide bookkeeping persisted alongside the data files (spec §3).
/// `-1` for `first_leaf_path`/`last_leaf_path` means the map holds no leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeState {
    pub size: u64,
    pub first_leaf_path: i64,
    pub last_leaf_path: i64,
    pub root_hash: Option<Hash>,
}

impl TreeState {
    pub fn empty() -> Self {
        Self {
            size: 0,
            first_leaf_path: -1,
            last_leaf_path: -1,
            root_hash: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Default for TreeState {
    fn default() -> Self {
        Self::empty()
    }
}

/// A decoded leaf record: `path:u64 | key_len:varint | key | value_len:varint
/// | value | hash_len:u8 | hash_bytes` (spec §6).
#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub path: Path,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub hash: Option<Hash>,
}

fn encode_leaf(path: u64, key: &[u8], value: &[u8], hash: Option<&Hash>) -> VirtualMapResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + key.len() + value.len());
    buf.extend_from_slice(&path.to_le_bytes());
    wire::write_varint(&mut buf, key.len() as u32)?;
    buf.extend_from_slice(key);
    wire::write_varint(&mut buf, value.len() as u32)?;
    buf.extend_from_slice(value);
    match hash {
        Some(h) => {
            buf.push(h.len() as u8);
            buf.extend_from_slice(h.as_bytes());
        }
        None => buf.push(0),
    }
    Ok(buf)
}

fn decode_leaf(bytes: &[u8]) -> VirtualMapResult<LeafRecord> {
    if bytes.len() < 8 {
        return Err(VirtualMapError::Corruption(
            "leaf record shorter than path prefix".to_string(),
        ));
    }
    let mut cursor = &bytes[8..];
    let path = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let key_len = wire::read_varint(&mut cursor)? as usize;
    let mut key = vec![0u8; key_len];
    cursor.read_exact(&mut key)?;
    let value_len = wire::read_varint(&mut cursor)? as usize;
    let mut value = vec![0u8; value_len];
    cursor.read_exact(&mut value)?;
    let mut hash_len_buf = [0u8; 1];
    cursor.read_exact(&mut hash_len_buf)?;
    let hash_len = hash_len_buf[0] as usize;
    let hash = if hash_len == 0 {
        None
    } else {
        let mut hash_bytes = vec![0u8; hash_len];
        cursor.read_exact(&mut hash_bytes)?;
        Some(Hash(hash_bytes))
    };
    Ok(LeafRecord {
        path: Path::new(path),
        key,
        value,
        hash,
    })
}

fn encode_internal(path: u64, hash: &Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + hash.len());
    buf.extend_from_slice(&path.to_le_bytes());
    buf.push(hash.len() as u8);
    buf.extend_from_slice(hash.as_bytes());
    buf
}

fn decode_internal_hash(bytes: &[u8]) -> VirtualMapResult<Hash> {
    if bytes.len() < 9 {
        return Err(VirtualMapError::Corruption(
            "internal record shorter than path+len prefix".to_string(),
        ));
    }
    let hash_len = bytes[8] as usize;
    if bytes.len() != 9 + hash_len {
        return Err(VirtualMapError::Corruption(
            "internal record length mismatch".to_string(),
        ));
    }
    Ok(Hash(bytes[9..].to_vec()))
}

/// A leaf mutation to persist in one flush (spec §4.F `save_records`).
pub enum LeafUpdate {
    Put {
        path: Path,
        key: Vec<u8>,
        value: Vec<u8>,
        hash: Option<Hash>,
    },
    Delete {
        path: Path,
        key: Vec<u8>,
    },
    /// `path` stopped holding a leaf because it was split into two children;
    /// tombstone the leaf index slot without touching `key_to_path`, since
    /// the key (if any survives) has already been re-pointed elsewhere.
    Vacate {
        path: Path,
    },
}

/// Composition of the key-to-path map, the two path-indexed record stores,
/// and the tree-wide state: the crate's single source of durable truth
/// (spec §4.F).
pub struct DataSource {
    dir: PathBuf,
    key_to_path: Hdhm,
    leaves: PathIndex,
    internals: PathIndex,
    state: RwLock<TreeState>,
    pub leaf_pause_gate: PauseGate,
    pub internal_pause_gate: PauseGate,
}

impl DataSource {
    pub fn open(config: &VirtualMapConfig) -> VirtualMapResult<Self> {
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir)?;
        let key_to_path = Hdhm::open(dir.join("keyToPath"), config.bucket_count)?;
        let leaves = PathIndex::open(dir.join("leafPathIndex"), "dat")?;
        let internals = PathIndex::open(dir.join("internalPathIndex"), "dat")?;
        let state = load_state(&dir.join("state"))?;
        Ok(Self {
            dir,
            key_to_path,
            leaves,
            internals,
            state: RwLock::new(state),
            leaf_pause_gate: PauseGate::new(),
            internal_pause_gate: PauseGate::new(),
        })
    }

    pub fn state(&self) -> TreeState {
        self.state.read().clone()
    }

    pub fn find_leaf_by_key(&self, key: &[u8]) -> VirtualMapResult<Option<LeafRecord>> {
        match self.key_to_path.get(key) {
            None => Ok(None),
            Some(path) => self.find_leaf_by_path(Path::new(path)),
        }
    }

    pub fn find_leaf_by_path(&self, path: Path) -> VirtualMapResult<Option<LeafRecord>> {
        match self.leaves.get(path.get()) {
            Ok(bytes) => Ok(Some(decode_leaf(&bytes)?)),
            Err(VirtualMapError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn find_internal_hash(&self, path: Path) -> VirtualMapResult<Option<Hash>> {
        match self.internals.get(path.get()) {
            Ok(bytes) => Ok(Some(decode_internal_hash(&bytes)?)),
            Err(VirtualMapError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Durably apply one version's worth of mutations. Commits the new
    /// `TreeState` only after both path-index writer sessions have been
    /// sealed, via a temp-file-then-rename swap of `state` so a reader never
    /// observes a half-written flush (spec §4.F).
    pub fn save_records(
        &self,
        new_state: TreeState,
        internal_updates: &[(Path, Hash)],
        leaf_updates: &[LeafUpdate],
    ) -> VirtualMapResult<()> {
        self.leaves.start_writing()?;
        self.internals.start_writing()?;

        let mut write_result = self.apply_updates(internal_updates, leaf_updates);
        if write_result.is_ok() {
            write_result = self.leaves.end_writing().and(self.internals.end_writing());
        } else {
            let _ = self.leaves.end_writing();
            let _ = self.internals.end_writing();
        }
        write_result?;

        self.commit_state(new_state)
    }

    fn apply_updates(
        &self,
        internal_updates: &[(Path, Hash)],
        leaf_updates: &[LeafUpdate],
    ) -> VirtualMapResult<()> {
        for (path, hash) in internal_updates {
            let record = encode_internal(path.get(), hash);
            self.internals.put(path.get(), &record)?;
        }
        for update in leaf_updates {
            match update {
                LeafUpdate::Put {
                    path,
                    key,
                    value,
                    hash,
                } => {
                    let record = encode_leaf(path.get(), key, value, hash.as_ref())?;
                    self.leaves.put(path.get(), &record)?;
                    self.key_to_path.put(key, path.get())?;
                }
                LeafUpdate::Delete { path, key } => {
                    let tombstone = encode_leaf(path.get(), key, &[], None)?;
                    self.leaves.put(path.get(), &tombstone)?;
                    self.key_to_path.remove(key)?;
                }
                LeafUpdate::Vacate { path } => {
                    let tombstone = encode_leaf(path.get(), &[], &[], None)?;
                    self.leaves.put(path.get(), &tombstone)?;
                }
            }
        }
        Ok(())
    }

    fn commit_state(&self, new_state: TreeState) -> VirtualMapResult<()> {
        let state_path = self.dir.join("state");
        let tmp_path = self.dir.join("state.tmp");
        let bytes = bincode::serialize(&new_state)
            .map_err(|e| VirtualMapError::SerializationError(e.to_string()))?;
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &state_path)?;
        *self.state.write() = new_state;
        Ok(())
    }

    /// Fold a size/byte-bounded prefix of sealed leaf files into one.
    pub fn merge_leaves(&self, max_files: usize, target_bytes: u64) -> VirtualMapResult<usize> {
        self.leaves
            .merge(&self.leaf_pause_gate, max_files, target_bytes)
    }

    /// Fold a size/byte-bounded prefix of sealed internal-node files into one.
    pub fn merge_internals(&self, max_files: usize, target_bytes: u64) -> VirtualMapResult<usize> {
        self.internals
            .merge(&self.internal_pause_gate, max_files, target_bytes)
    }

    pub fn compact_key_to_path(&self) -> VirtualMapResult<()> {
        self.key_to_path.compact()
    }

    /// Hard-link every sealed file, the bucket array, and `state` into
    /// `directory`, falling back to a byte copy across filesystem boundaries
    /// (spec §4.F).
    pub fn snapshot(&self, directory: impl Into<PathBuf>) -> VirtualMapResult<()> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        link_or_copy(&self.dir.join("state"), &directory.join("state"))?;

        for (sub, idx) in [("leafPathIndex", &self.leaves), ("internalPathIndex", &self.internals)] {
            let out_dir = directory.join(sub);
            fs::create_dir_all(&out_dir)?;
            for sealed in idx.all_files() {
                let target = out_dir.join(sealed.path.file_name().unwrap());
                link_or_copy(&sealed.path, &target)?;
            }
        }

        let key_dir = self.dir.join("keyToPath");
        let out_key_dir = directory.join("keyToPath");
        fs::create_dir_all(&out_key_dir)?;
        for entry in fs::read_dir(&key_dir)? {
            let entry = entry?;
            let target = out_key_dir.join(entry.file_name());
            link_or_copy(&entry.path(), &target)?;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &FsPath {
        &self.dir
    }
}

fn link_or_copy(src: &FsPath, dst: &FsPath) -> VirtualMapResult<()> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

fn load_state(path: &FsPath) -> VirtualMapResult<TreeState> {
    if !path.exists() {
        return Ok(TreeState::empty());
    }
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(TreeState::empty());
    }
    bincode::deserialize(&bytes).map_err(|e| VirtualMapError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> VirtualMapConfig {
        VirtualMapConfig::new(dir.path()).with_bucket_count(16)
    }

    #[test]
    fn empty_state_round_trips_through_load() {
        let dir = TempDir::new().unwrap();
        let ds = DataSource::open(&config(&dir)).unwrap();
        assert!(ds.state().is_empty());
    }

    #[test]
    fn save_and_find_leaf_by_key_and_path() {
        let dir = TempDir::new().unwrap();
        let ds = DataSource::open(&config(&dir)).unwrap();

        let path = Path::new(7);
        let hash = Hash(vec![1, 2, 3]);
        let update = LeafUpdate::Put {
            path,
            key: b"alice".to_vec(),
            value: b"100".to_vec(),
            hash: Some(hash.clone()),
        };
        let mut state = TreeState::empty();
        state.size = 1;
        state.first_leaf_path = 7;
        state.last_leaf_path = 7;
        ds.save_records(state, &[], &[update]).unwrap();

        let by_key = ds.find_leaf_by_key(b"alice").unwrap().unwrap();
        assert_eq!(by_key.value, b"100");
        assert_eq!(by_key.hash, Some(hash));

        let by_path = ds.find_leaf_by_path(path).unwrap().unwrap();
        assert_eq!(by_path.key, b"alice");
        assert_eq!(ds.state().size, 1);
    }

    #[test]
    fn reopen_recovers_state_and_records() {
        let dir = TempDir::new().unwrap();
        {
            let ds = DataSource::open(&config(&dir)).unwrap();
            let update = LeafUpdate::Put {
                path: Path::new(3),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                hash: None,
            };
            let mut state = TreeState::empty();
            state.size = 1;
            state.first_leaf_path = 3;
            state.last_leaf_path = 3;
            ds.save_records(state, &[], &[update]).unwrap();
        }
        let ds = DataSource::open(&config(&dir)).unwrap();
        assert_eq!(ds.state().size, 1);
        assert_eq!(
            ds.find_leaf_by_key(b"k").unwrap().unwrap().value,
            b"v".to_vec()
        );
    }

    #[test]
    fn delete_removes_key_to_path_entry() {
        let dir = TempDir::new().unwrap();
        let ds = DataSource::open(&config(&dir)).unwrap();
        let path = Path::new(1);
        ds.save_records(
            TreeState::empty(),
            &[],
            &[LeafUpdate::Put {
                path,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                hash: None,
            }],
        )
        .unwrap();
        assert!(ds.find_leaf_by_key(b"k").unwrap().is_some());

        ds.save_records(
            TreeState::empty(),
            &[],
            &[LeafUpdate::Delete {
                path,
                key: b"k".to_vec(),
            }],
        )
        .unwrap();
        assert!(ds.find_leaf_by_key(b"k").unwrap().is_none());
    }
}
