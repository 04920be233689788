//! Memory-indexed disk key-value store: a [`crate::longlist::LongList`] from
//! `path -> DataLocation` backed by a [`FileSet`] of immutable records
//! (spec §4.D). Every stored record's first 8 bytes are its own path
//! (spec §6's leaf/internal record layouts both start with `path:u64`), which
//! lets `merge` recover which path each record belongs to without a separate
//! side index.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::datastore::file::{FileSet, SealedFile};
use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::longlist::LongList;
use crate::wire::DataLocation;

/// A binary semaphore a writer can raise to pause an in-flight merge between
/// records (spec §5: "the `pauseMerging` binary gate").
#[derive(Default)]
pub struct PauseGate {
    paused: AtomicBool,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Busy-poll until the gate is not held. Merge calls this between
    /// records; real deployments would park the thread on a condvar, but the
    /// gate's contract (spec §5) only requires suspension, not a particular
    /// wait strategy.
    pub fn wait_if_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }
}

fn extract_path(record: &[u8]) -> VirtualMapResult<u64> {
    if record.len() < 8 {
        return Err(VirtualMapError::Corruption(
            "record shorter than the 8-byte path prefix".to_string(),
        ));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&record[..8]);
    Ok(u64::from_le_bytes(buf))
}

/// The path→location index for one record kind (leaves or internal nodes).
pub struct PathIndex {
    index: LongList,
    files: FileSet,
    merging: Mutex<()>,
}

impl PathIndex {
    pub fn open(dir: impl Into<PathBuf>, extension: &'static str) -> VirtualMapResult<Self> {
        let files = FileSet::open(dir, extension)?;
        let index = LongList::new();
        // Replay every sealed file in write order so later files' records
        // overwrite earlier ones for the same path, reconstructing the
        // latest-location index.
        for sealed in files.all_files() {
            for (offset, bytes) in sealed.iter_records()? {
                let path = extract_path(&bytes)?;
                let loc = DataLocation::new(sealed.id, offset)?;
                index.put(path as usize, loc.0);
            }
        }
        Ok(Self {
            index,
            files,
            merging: Mutex::new(()),
        })
    }

    /// Read the record bytes stored for `path`.
    pub fn get(&self, path: u64) -> VirtualMapResult<Vec<u8>> {
        let loc = DataLocation(self.index.get(path as usize));
        if loc.is_none() {
            return Err(VirtualMapError::NotFound);
        }
        self.files.read(loc)
    }

    pub fn contains(&self, path: u64) -> bool {
        !DataLocation(self.index.get(path as usize)).is_none()
    }

    pub fn start_writing(&self) -> VirtualMapResult<()> {
        self.files.start_writing()
    }

    pub fn put(&self, path: u64, bytes: &[u8]) -> VirtualMapResult<()> {
        let loc = self.files.write(path, bytes)?;
        self.index.put(path as usize, loc.0);
        Ok(())
    }

    pub fn end_writing(&self) -> VirtualMapResult<()> {
        self.files.end_writing()?;
        Ok(())
    }

    pub fn is_writing(&self) -> bool {
        self.files.is_writing()
    }

    /// Merge a size/count-bounded prefix of sealed files into one new file,
    /// keeping only the latest surviving record per path (spec §4.D).
    /// Returns the number of files merged (0 if there was nothing to do).
    pub fn merge(
        &self,
        pause_gate: &PauseGate,
        max_files: usize,
        target_bytes: u64,
    ) -> VirtualMapResult<usize> {
        let _guard = self.merging.lock();
        if self.files.is_writing() {
            return Err(VirtualMapError::MergeError(
                "cannot merge while a write session is open".to_string(),
            ));
        }

        let all = self.files.all_files();
        if all.len() < 2 {
            return Ok(0);
        }

        let mut prefix: Vec<Arc<SealedFile>> = Vec::new();
        let mut total = 0u64;
        for f in &all {
            if prefix.len() >= max_files {
                break;
            }
            if !prefix.is_empty() && total + f.size_bytes > target_bytes {
                break;
            }
            total += f.size_bytes;
            prefix.push(f.clone());
        }
        if prefix.len() < 2 {
            return Ok(0);
        }
        let prefix_ids: Vec<u32> = prefix.iter().map(|f| f.id).collect();

        // For every path touched anywhere in the prefix, the live record is
        // whichever prefix file currently owns `index[path]`; anything else
        // in the prefix is dead and dropped.
        let mut live: Vec<(u64, u64, Vec<u8>)> = Vec::new(); // (path, original_offset, bytes)
        for f in &prefix {
            pause_gate.wait_if_paused();
            for (offset, bytes) in f.iter_records()? {
                let path = extract_path(&bytes)?;
                let current = DataLocation(self.index.get(path as usize));
                if current.file_id() == f.id && current.offset() == offset {
                    live.push((path, offset, bytes));
                }
            }
        }

        if live.is_empty() {
            // Every record in the prefix was superseded; just drop the files.
            self.files.remove(&prefix_ids)?;
            return Ok(prefix.len());
        }

        let new_id = self.files.reserve_file_id();
        let new_path = self.files.build_path(new_id);
        let tmp_path = new_path.with_extension("merging");
        {
            use std::io::Write;
            let mut out = std::fs::File::create(&tmp_path)?;
            let mut offset = 0u64;
            let mut placements = Vec::with_capacity(live.len());
            for (path, _old_offset, bytes) in &live {
                pause_gate.wait_if_paused();
                let mut framed = Vec::with_capacity(bytes.len() + 5);
                crate::wire::write_record(&mut framed, bytes)?;
                out.write_all(&framed)?;
                placements.push((*path, offset));
                offset += framed.len() as u64;
            }
            out.sync_all()?;
            drop(out);
            std::fs::rename(&tmp_path, &new_path)?;

            for (path, new_offset) in placements {
                let loc = DataLocation::new(new_id, new_offset)?;
                // Only repoint if nothing else has taken ownership of this
                // path since the scan above (impossible under the
                // single-writer discipline, checked defensively).
                let current = DataLocation(self.index.get(path as usize));
                if prefix_ids.contains(&current.file_id()) {
                    self.index.put(path as usize, loc.0);
                }
            }
        }

        let sealed = Arc::new(crate::datastore::file::open_sealed_for_merge(
            new_id, new_path,
        )?);
        self.files.replace(&prefix_ids, sealed);
        Ok(prefix.len())
    }

    pub fn all_files(&self) -> Vec<Arc<SealedFile>> {
        self.files.all_files()
    }
}
