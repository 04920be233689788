//! Append-only data files and the file set that indexes them (spec §4.C).
//! Grounded on the generation-log idiom in the `robwil-kvs` example
//! (`sorted_gen_list`, one append-only writer per generation, zero-padded
//! numeric file names) and the teacher's `OpenOptions` conventions.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::wire::{self, DataLocation};

/// A sealed, read-only data file.
pub struct SealedFile {
    pub id: u32,
    pub path: PathBuf,
    pub min_path: u64,
    pub max_path: u64,
    file: File,
    pub size_bytes: u64,
}

/// Open a sealed file that was written outside the normal [`FileSet`]
/// writing-session path (used by [`crate::datastore::path_index::PathIndex::merge`]
/// to wrap its freshly-written output file before publishing it).
pub(crate) fn open_sealed_for_merge(id: u32, path: PathBuf) -> VirtualMapResult<SealedFile> {
    SealedFile::open(id, path, 0, 0)
}

impl SealedFile {
    fn open(id: u32, path: PathBuf, min_path: u64, max_path: u64) -> VirtualMapResult<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        let size_bytes = file.metadata()?.len();
        Ok(Self {
            id,
            path,
            min_path,
            max_path,
            file,
            size_bytes,
        })
    }

    /// Read the record at `offset` (the start of its varint length prefix).
    pub fn read_at(&self, offset: u64) -> VirtualMapResult<Vec<u8>> {
        let mut len_buf = [0u8; 5];
        let available = (self.size_bytes.saturating_sub(offset)).min(5) as usize;
        if available == 0 {
            return Err(VirtualMapError::Corruption(format!(
                "offset {offset} beyond end of file {}",
                self.path.display()
            )));
        }
        self.file.read_at(&mut len_buf[..available], offset)?;
        let (len, varint_len) = read_varint_prefix(&len_buf[..available])?;
        let data_start = offset + varint_len as u64;
        if data_start + len as u64 > self.size_bytes {
            return Err(VirtualMapError::Corruption(format!(
                "record length {len} at offset {offset} exceeds file size {}",
                self.size_bytes
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.file.read_at(&mut buf, data_start)?;
        Ok(buf)
    }

    /// Walk every record in the file in write order, yielding
    /// `(offset_of_length_prefix, record_bytes)`. Used by merge to discover
    /// every path a file still holds a record for.
    pub fn iter_records(&self) -> VirtualMapResult<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset < self.size_bytes {
            let bytes = self.read_at(offset)?;
            let varint_len = varint_encoded_len(bytes.len() as u32);
            out.push((offset, bytes.clone()));
            offset += varint_len as u64 + bytes.len() as u64;
        }
        Ok(out)
    }
}

fn varint_encoded_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn read_varint_prefix(bytes: &[u8]) -> VirtualMapResult<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(VirtualMapError::Corruption(
        "truncated varint length prefix".to_string(),
    ))
}

/// An in-progress write session. Only one may exist per [`FileSet`] at a
/// time (spec §4.C: "only one writing session exists at a time").
pub struct WritingSession {
    id: u32,
    path: PathBuf,
    file: Mutex<File>,
    offset: std::sync::atomic::AtomicU64,
    min_path: std::sync::atomic::AtomicU64,
    max_path: std::sync::atomic::AtomicU64,
    touched: std::sync::atomic::AtomicBool,
}

impl WritingSession {
    /// Append `bytes` as a new record, returning its data location.
    pub fn write(&self, path_hint: u64, bytes: &[u8]) -> VirtualMapResult<DataLocation> {
        let mut file = self.file.lock();
        let mut buf = Vec::with_capacity(bytes.len() + 5);
        wire::write_record(&mut buf, bytes)?;
        let offset = self.offset.load(Ordering::Relaxed);
        file.write_all(&buf)?;
        self.offset.store(offset + buf.len() as u64, Ordering::Relaxed);
        drop(file);

        if !self.touched.swap(true, Ordering::AcqRel) {
            self.min_path.store(path_hint, Ordering::Relaxed);
            self.max_path.store(path_hint, Ordering::Relaxed);
        } else {
            self.min_path.fetch_min(path_hint, Ordering::Relaxed);
            self.max_path.fetch_max(path_hint, Ordering::Relaxed);
        }

        DataLocation::new(self.id, offset)
    }
}

/// An ordered list of sealed files plus at most one in-progress writer
/// (spec §4.C).
pub struct FileSet {
    dir: PathBuf,
    extension: &'static str,
    sealed: Mutex<Vec<Arc<SealedFile>>>,
    writing: Mutex<Option<WritingSession>>,
    next_file_id: AtomicU32,
}

impl FileSet {
    pub fn open(dir: impl Into<PathBuf>, extension: &'static str) -> VirtualMapResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut entries: Vec<(u32, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
                    .map(|id| (id, p))
            })
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut sealed = Vec::with_capacity(entries.len());
        let mut max_id = 0u32;
        for (id, path) in entries {
            max_id = max_id.max(id);
            // Bounds are recovered by the owner (PathIndex) replaying the
            // index; the file set itself does not need them until merge time,
            // so placeholders are fixed up by `set_bounds`.
            sealed.push(Arc::new(SealedFile::open(id, path, u64::MAX, 0)?));
        }

        Ok(Self {
            dir,
            extension,
            sealed: Mutex::new(sealed),
            writing: Mutex::new(None),
            next_file_id: AtomicU32::new(max_id.wrapping_add(1)),
        })
    }

    fn file_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id:08}.{}", self.extension))
    }

    /// Begin a new write session. Fails with `AlreadyWriting` if one is open.
    pub fn start_writing(&self) -> VirtualMapResult<()> {
        let mut writing = self.writing.lock();
        if writing.is_some() {
            return Err(VirtualMapError::AlreadyWriting);
        }
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.file_path(id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        *writing = Some(WritingSession {
            id,
            path,
            file: Mutex::new(file),
            offset: std::sync::atomic::AtomicU64::new(0),
            min_path: std::sync::atomic::AtomicU64::new(0),
            max_path: std::sync::atomic::AtomicU64::new(0),
            touched: std::sync::atomic::AtomicBool::new(false),
        });
        Ok(())
    }

    /// Append a record within the currently open session.
    pub fn write(&self, path_hint: u64, bytes: &[u8]) -> VirtualMapResult<DataLocation> {
        let writing = self.writing.lock();
        match writing.as_ref() {
            Some(session) => session.write(path_hint, bytes),
            None => Err(VirtualMapError::MergeError(
                "write called without an open session".to_string(),
            )),
        }
    }

    /// Seal the current session and add it to the set.
    pub fn end_writing(&self) -> VirtualMapResult<Option<Arc<SealedFile>>> {
        let mut writing = self.writing.lock();
        let session = match writing.take() {
            Some(s) => s,
            None => return Ok(None),
        };
        session.file.lock().sync_all()?;
        let min_path = session.min_path.load(Ordering::Relaxed);
        let max_path = session.max_path.load(Ordering::Relaxed);
        let sealed = Arc::new(SealedFile::open(session.id, session.path, min_path, max_path)?);
        self.sealed.lock().push(sealed.clone());
        Ok(Some(sealed))
    }

    pub fn read(&self, loc: DataLocation) -> VirtualMapResult<Vec<u8>> {
        if loc.is_none() {
            return Err(VirtualMapError::NotFound);
        }
        let sealed = self.sealed.lock();
        let file = sealed
            .iter()
            .find(|f| f.id == loc.file_id())
            .cloned()
            .ok_or(VirtualMapError::NotFound)?;
        drop(sealed);
        file.read_at(loc.offset())
    }

    pub fn all_files(&self) -> Vec<Arc<SealedFile>> {
        self.sealed.lock().clone()
    }

    /// Remove `files` from the set (used after a successful merge).
    pub fn remove(&self, files: &[u32]) -> VirtualMapResult<()> {
        let mut sealed = self.sealed.lock();
        let removed: Vec<Arc<SealedFile>> = sealed
            .iter()
            .filter(|f| files.contains(&f.id))
            .cloned()
            .collect();
        sealed.retain(|f| !files.contains(&f.id));
        drop(sealed);
        for f in removed {
            let _ = fs::remove_file(&f.path);
        }
        Ok(())
    }

    /// Add an already-written sealed file to the set (used by merge to
    /// publish its output). Replaces the files it supersedes atomically and
    /// unlinks their underlying paths.
    pub fn replace(&self, old_ids: &[u32], new_file: Arc<SealedFile>) {
        let mut sealed = self.sealed.lock();
        let removed: Vec<Arc<SealedFile>> = sealed
            .iter()
            .filter(|f| old_ids.contains(&f.id))
            .cloned()
            .collect();
        sealed.retain(|f| !old_ids.contains(&f.id));
        sealed.push(new_file);
        sealed.sort_by_key(|f| f.id);
        drop(sealed);
        for f in removed {
            let _ = fs::remove_file(&f.path);
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writing.lock().is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_id_hint(&self) -> u32 {
        self.next_file_id.load(Ordering::SeqCst)
    }

    pub fn reserve_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn build_path(&self, id: u32) -> PathBuf {
        self.file_path(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let fs_ = FileSet::open(dir.path(), "dat").unwrap();
        fs_.start_writing().unwrap();
        let loc1 = fs_.write(1, b"hello").unwrap();
        let loc2 = fs_.write(2, b"world!").unwrap();
        fs_.end_writing().unwrap();

        assert_eq!(fs_.read(loc1).unwrap(), b"hello");
        assert_eq!(fs_.read(loc2).unwrap(), b"world!");
    }

    #[test]
    fn double_writing_session_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fs_ = FileSet::open(dir.path(), "dat").unwrap();
        fs_.start_writing().unwrap();
        assert!(matches!(
            fs_.start_writing(),
            Err(VirtualMapError::AlreadyWriting)
        ));
    }

    #[test]
    fn reopening_discovers_sealed_files() {
        let dir = TempDir::new().unwrap();
        {
            let fs_ = FileSet::open(dir.path(), "dat").unwrap();
            fs_.start_writing().unwrap();
            fs_.write(1, b"persisted").unwrap();
            fs_.end_writing().unwrap();
        }
        let fs_ = FileSet::open(dir.path(), "dat").unwrap();
        assert_eq!(fs_.all_files().len(), 1);
    }

    #[test]
    fn read_of_absent_location_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs_ = FileSet::open(dir.path(), "dat").unwrap();
        assert!(matches!(
            fs_.read(DataLocation::NONE),
            Err(VirtualMapError::NotFound)
        ));
    }
}
