//! Off-heap, conceptually unbounded `u64 -> u64` mapping, allocated in fixed
//! chunks so sparse writes far out don't force allocating everything below
//! them (spec §4.B). Grounded on the chunked-page bookkeeping in the
//! teacher's `storage::cache::PageCache`, generalized from `Vec<u8>` pages to
//! atomic `u64` slots so single-slot writes are torn-free for concurrent
//! readers.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Slots per chunk: 1 MiB worth of `u64`s, per spec §4.B ("chunks of 1 MiB of
/// slots").
pub const CHUNK_LEN: usize = (1024 * 1024) / 8;

type Chunk = Box<[AtomicU64]>;

fn new_chunk() -> Chunk {
    (0..CHUNK_LEN).map(|_| AtomicU64::new(0)).collect()
}

/// A dense, chunk-allocated `u64 -> u64` list. `get` on an index whose chunk
/// was never allocated returns `0`. Writers are expected to serialize among
/// themselves per the owning component's discipline (spec §4.B); the list
/// itself only guarantees that individual slot reads/writes are atomic, not
/// that concurrent writers to the same slot compose.
pub struct LongList {
    chunks: RwLock<Vec<Option<Chunk>>>,
    high_water: AtomicUsize,
}

impl LongList {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            high_water: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn split(index: usize) -> (usize, usize) {
        (index / CHUNK_LEN, index % CHUNK_LEN)
    }

    /// Returns the value at `index`, or `0` if it was never written.
    pub fn get(&self, index: usize) -> u64 {
        let (chunk_idx, slot_idx) = Self::split(index);
        let chunks = self.chunks.read();
        match chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
            Some(chunk) => chunk[slot_idx].load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Writes `value` at `index`, allocating the backing chunk if this is the
    /// first write into its range.
    pub fn put(&self, index: usize, value: u64) {
        let (chunk_idx, slot_idx) = Self::split(index);
        {
            let chunks = self.chunks.read();
            if let Some(Some(chunk)) = chunks.get(chunk_idx) {
                chunk[slot_idx].store(value, Ordering::Release);
                self.bump_high_water(index + 1);
                return;
            }
        }
        // Slow path: allocate the chunk (and any gap chunks before it).
        let mut chunks = self.chunks.write();
        if chunks.len() <= chunk_idx {
            chunks.resize_with(chunk_idx + 1, || None);
        }
        if chunks[chunk_idx].is_none() {
            chunks[chunk_idx] = Some(new_chunk());
        }
        chunks[chunk_idx].as_ref().unwrap()[slot_idx].store(value, Ordering::Release);
        drop(chunks);
        self.bump_high_water(index + 1);
    }

    fn bump_high_water(&self, candidate: usize) {
        self.high_water.fetch_max(candidate, Ordering::AcqRel);
    }

    /// The highest `i+1` ever written (i.e. the list's logical size).
    pub fn size(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    /// Drop whole chunks covering `[0, up_to_index)`. Only whole chunks are
    /// released, per spec §4.B.
    pub fn trim_before(&self, up_to_index: usize) {
        let (chunk_idx, offset) = Self::split(up_to_index);
        let last_full_chunk = if offset == 0 { chunk_idx } else { chunk_idx };
        let mut chunks = self.chunks.write();
        for c in chunks.iter_mut().take(last_full_chunk) {
            *c = None;
        }
    }
}

impl Default for LongList {
    fn default() -> Self {
        Self::new()
    }
}
