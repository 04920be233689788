//! Half-disk hash map: a persistent hash map from arbitrary-length keys to
//! `u64` paths, with an on-disk fixed bucket array and an append-only chain
//! file per spec §4.E / §6. Grounded on the teacher's mmap-backed hot region
//! (`storage::persistent::setup_memory_mapping`) for the bucket array, and the
//! `robwil-kvs` append-only log idiom for the chain file.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::wire::{self, DataLocation};

const TOMBSTONE: u64 = u64::MAX;

fn hash_key(key: &[u8], bucket_count: u32) -> usize {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    (hasher.finalize() as usize) & (bucket_count as usize - 1)
}

/// The fixed-size, mmap-backed array of chain-head locations.
struct BucketArray {
    path: PathBuf,
    bucket_count: u32,
    mmap: RwLock<MmapMut>,
}

impl BucketArray {
    fn open(path: PathBuf, bucket_count: u32) -> VirtualMapResult<Self> {
        if !bucket_count.is_power_of_two() {
            return Err(VirtualMapError::ConfigurationError(
                "bucket_count must be a power of two".to_string(),
            ));
        }
        let needed = bucket_count as u64 * 8;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        let mmap = unsafe { MmapOptions::new().len(needed as usize).map_mut(&file)? };
        Ok(Self {
            path,
            bucket_count,
            mmap: RwLock::new(mmap),
        })
    }

    fn get_head(&self, bucket: usize) -> DataLocation {
        let mmap = self.mmap.read();
        let start = bucket * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mmap[start..start + 8]);
        DataLocation::from_le_bytes(buf)
    }

    fn set_head(&self, bucket: usize, loc: DataLocation) {
        let mut mmap = self.mmap.write();
        let start = bucket * 8;
        mmap[start..start + 8].copy_from_slice(&loc.to_le_bytes());
    }

    fn flush(&self) -> VirtualMapResult<()> {
        self.mmap
            .read()
            .flush()
            .map_err(|e| VirtualMapError::FatalIoError(e.to_string()))
    }
}

/// One node in a bucket's collision chain:
/// `key_len:varint | key_bytes | value:u64 | next_in_chain:u64`.
struct ChainNode {
    key: Vec<u8>,
    value: u64,
    next: DataLocation,
}

fn write_chain_node<W: Write>(mut w: W, node: &ChainNode) -> VirtualMapResult<()> {
    wire::write_varint(&mut w, node.key.len() as u32)?;
    w.write_all(&node.key)?;
    w.write_all(&node.value.to_le_bytes())?;
    w.write_all(&node.next.to_le_bytes())?;
    Ok(())
}

fn write_tombstone<W: Write>(mut w: W, next: DataLocation) -> VirtualMapResult<()> {
    wire::write_varint(&mut w, 0)?;
    w.write_all(&TOMBSTONE.to_le_bytes())?;
    w.write_all(&next.to_le_bytes())?;
    Ok(())
}

struct ChainFile {
    id: u32,
    file: RwLock<File>,
    len: std::sync::atomic::AtomicU64,
}

impl ChainFile {
    fn open(path: &Path, id: u32) -> VirtualMapResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            id,
            file: RwLock::new(file),
            len: std::sync::atomic::AtomicU64::new(len),
        })
    }

    fn append(&self, bytes: &[u8]) -> VirtualMapResult<DataLocation> {
        use std::sync::atomic::Ordering;
        let mut file = self.file.write();
        let offset = self.len.load(Ordering::Relaxed);
        file.write_all(bytes)?;
        file.flush()?;
        self.len.store(offset + bytes.len() as u64, Ordering::Relaxed);
        DataLocation::new(self.id, offset)
    }

    fn read_chain_from(&self, start: DataLocation) -> VirtualMapResult<Vec<(u64, ChainNode)>> {
        let mut out = Vec::new();
        let mut cursor = start;
        let mut file = self.file.write();
        while !cursor.is_none() {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(cursor.offset()))?;
            let key_len = wire::read_varint(&mut *file)? as usize;
            let mut key = vec![0u8; key_len];
            file.read_exact(&mut key)?;
            let mut value_buf = [0u8; 8];
            file.read_exact(&mut value_buf)?;
            let value = u64::from_le_bytes(value_buf);
            let mut next_buf = [0u8; 8];
            file.read_exact(&mut next_buf)?;
            let next = DataLocation::from_le_bytes(next_buf);
            out.push((
                cursor.offset(),
                ChainNode {
                    key,
                    value,
                    next,
                },
            ));
            cursor = next;
        }
        Ok(out)
    }
}

/// A persistent key→`u64` hash map with on-disk buckets and an append-only
/// chain log (spec §4.E).
pub struct Hdhm {
    dir: PathBuf,
    buckets: BucketArray,
    chain: RwLock<ChainFile>,
    /// In-memory head cache mirroring the bucket array, avoiding an mmap read
    /// on every lookup; kept consistent by `put`/`remove`/`compact`.
    memo: RwLock<HashMap<Vec<u8>, u64>>,
}

impl Hdhm {
    pub fn open(dir: impl Into<PathBuf>, bucket_count: u32) -> VirtualMapResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let buckets = BucketArray::open(dir.join("buckets.dat"), bucket_count)?;
        let chain_id = Self::latest_chain_id(&dir)?;
        let chain = ChainFile::open(&dir.join(format!("chain-{chain_id:08}.dat")), chain_id)?;

        let map = Self {
            dir,
            buckets,
            chain: RwLock::new(chain),
            memo: RwLock::new(HashMap::new()),
        };
        map.rebuild_memo()?;
        Ok(map)
    }

    fn latest_chain_id(dir: &Path) -> VirtualMapResult<u32> {
        let mut max_id = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(rest) = name
                    .strip_prefix("chain-")
                    .and_then(|s| s.strip_suffix(".dat"))
                {
                    if let Ok(id) = rest.parse::<u32>() {
                        max_id = Some(max_id.map_or(id, |m: u32| m.max(id)));
                    }
                }
            }
        }
        Ok(max_id.unwrap_or(0))
    }

    fn rebuild_memo(&self) -> VirtualMapResult<()> {
        let mut memo = self.memo.write();
        let chain = self.chain.read();
        for bucket in 0..self.buckets.bucket_count as usize {
            let head = self.buckets.get_head(bucket);
            for (_offset, node) in chain.read_chain_from(head)? {
                if node.value == TOMBSTONE {
                    continue;
                }
                memo.insert(node.key, node.value);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.memo.read().get(key).copied()
    }

    pub fn put(&self, key: &[u8], value: u64) -> VirtualMapResult<()> {
        let bucket = hash_key(key, self.buckets.bucket_count);
        let head = self.buckets.get_head(bucket);
        let node = ChainNode {
            key: key.to_vec(),
            value,
            next: head,
        };
        let mut buf = Vec::with_capacity(key.len() + 17);
        write_chain_node(&mut buf, &node)?;
        let loc = self.chain.read().append(&buf)?;
        self.buckets.set_head(bucket, loc);
        self.memo.write().insert(key.to_vec(), value);
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> VirtualMapResult<bool> {
        if self.memo.read().get(key).is_none() {
            return Ok(false);
        }
        let bucket = hash_key(key, self.buckets.bucket_count);
        let head = self.buckets.get_head(bucket);
        let mut buf = Vec::new();
        write_tombstone(&mut buf, head)?;
        let loc = self.chain.read().append(&buf)?;
        self.buckets.set_head(bucket, loc);
        self.memo.write().remove(key);
        Ok(true)
    }

    /// Rewrite bucket heads and a fresh chain file, dropping tombstones and
    /// superseded duplicate keys. The new files are only swapped in once
    /// fully written and fsynced, so a crash mid-compaction leaves the
    /// previous (valid) bucket array/chain file untouched.
    pub fn compact(&self) -> VirtualMapResult<()> {
        let snapshot: HashMap<Vec<u8>, u64> = self.memo.read().clone();

        let new_chain_id = Self::latest_chain_id(&self.dir)? + 1;
        let new_chain_path = self.dir.join(format!("chain-{new_chain_id:08}.dat"));
        let tmp_chain_path = new_chain_path.with_extension("compacting");
        let new_chain = ChainFile::open(&tmp_chain_path, new_chain_id)?;

        let mut new_heads = vec![DataLocation::NONE; self.buckets.bucket_count as usize];
        for (key, value) in snapshot.iter() {
            let bucket = hash_key(key, self.buckets.bucket_count);
            let node = ChainNode {
                key: key.clone(),
                value: *value,
                next: new_heads[bucket],
            };
            let mut buf = Vec::new();
            write_chain_node(&mut buf, &node)?;
            new_heads[bucket] = new_chain.append(&buf)?;
        }
        new_chain.file.read().sync_all()?;
        drop(new_chain);
        std::fs::rename(&tmp_chain_path, &new_chain_path)?;

        for (bucket, loc) in new_heads.into_iter().enumerate() {
            self.buckets.set_head(bucket, loc);
        }
        self.buckets.flush()?;

        let old_chain_id = {
            let chain = self.chain.read();
            chain.id
        };
        *self.chain.write() = ChainFile::open(&new_chain_path, new_chain_id)?;
        if old_chain_id != new_chain_id {
            let _ = std::fs::remove_file(self.dir.join(format!("chain-{old_chain_id:08}.dat")));
        }
        Ok(())
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.bucket_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_remove_roundtrip() {
        let dir = TempDir::new().unwrap();
        let map = Hdhm::open(dir.path(), 16).unwrap();
        map.put(b"alice", 10).unwrap();
        map.put(b"bob", 20).unwrap();
        assert_eq!(map.get(b"alice"), Some(10));
        assert_eq!(map.get(b"bob"), Some(20));
        assert_eq!(map.get(b"carol"), None);

        assert!(map.remove(b"alice").unwrap());
        assert_eq!(map.get(b"alice"), None);
        assert!(!map.remove(b"alice").unwrap());
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        {
            let map = Hdhm::open(dir.path(), 16).unwrap();
            map.put(b"k1", 1).unwrap();
            map.put(b"k2", 2).unwrap();
            map.remove(b"k1").unwrap();
        }
        let map = Hdhm::open(dir.path(), 16).unwrap();
        assert_eq!(map.get(b"k1"), None);
        assert_eq!(map.get(b"k2"), Some(2));
    }

    #[test]
    fn compact_preserves_live_entries_and_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let map = Hdhm::open(dir.path(), 16).unwrap();
        for i in 0..50u64 {
            map.put(format!("key{i}").as_bytes(), i).unwrap();
        }
        for i in 0..25u64 {
            map.remove(format!("key{i}").as_bytes()).unwrap();
        }
        map.compact().unwrap();

        for i in 0..25u64 {
            assert_eq!(map.get(format!("key{i}").as_bytes()), None);
        }
        for i in 25..50u64 {
            assert_eq!(map.get(format!("key{i}").as_bytes()), Some(i));
        }
    }

    #[test]
    fn rejects_non_power_of_two_bucket_count() {
        let dir = TempDir::new().unwrap();
        assert!(Hdhm::open(dir.path(), 10).is_err());
    }
}
