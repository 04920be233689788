//! The mutate → freeze → hash → merge/flush pipeline (spec §4.I), grounded
//! on the teacher's single-writer-thread discipline (its `Arc<Mutex<..>>`
//! guarded `PersistentMerkleTree` mutation path) generalized to an explicit
//! background worker plus a channel, per the pack's "no async-colored
//! functions are required" redesign note.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::cache::{CacheOp, VersionedCache};
use crate::config::VirtualMapConfig;
use crate::datasource::{DataSource, LeafUpdate, TreeState};
use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::hasher::Hasher;
use crate::path::Path;

/// One sealed copy queued for the pipeline: the version's dirty leaf set and
/// the `TreeState` it produced (missing only the root hash, filled in by the
/// `Hashing` stage).
pub struct SealedCopy {
    pub version: u64,
    pub dirty_leaves: Vec<Path>,
    pub state: TreeState,
}

/// Runs one dedicated worker thread that drains sealed copies in order and
/// advances each through `Hashing -> (Merged | Flushed) -> Done` (spec
/// §4.I). `copy()` callers talk to this through [`Pipeline::submit`], which
/// applies the backpressure rule before handing the job to the channel.
pub struct Pipeline {
    sender: Sender<SealedCopy>,
    worker: Option<JoinHandle<()>>,
    queue_depth: Arc<AtomicUsize>,
    flushed_version: Arc<AtomicU64>,
    flush_signal: Arc<(Mutex<()>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    config: VirtualMapConfig,
}

impl Pipeline {
    pub fn new(config: VirtualMapConfig, source: Arc<DataSource>, cache: Arc<VersionedCache>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let flushed_version = Arc::new(AtomicU64::new(0));
        let flush_signal = Arc::new((Mutex::new(()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let hasher = Arc::new(Hasher::new(config.digest, config.hash_threads.resolve()));

        let worker = {
            let queue_depth = queue_depth.clone();
            let flushed_version = flushed_version.clone();
            let flush_signal = flush_signal.clone();
            let shutdown = shutdown.clone();
            let failed = failed.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name("virtualmap-pipeline".to_string())
                .spawn(move || {
                    run_worker(
                        receiver,
                        source,
                        cache,
                        hasher,
                        config,
                        queue_depth,
                        flushed_version,
                        flush_signal,
                        shutdown,
                        failed,
                    )
                })
                .expect("failed to spawn virtualmap-pipeline thread")
        };

        Self {
            sender,
            worker: Some(worker),
            queue_depth,
            flushed_version,
            flush_signal,
            shutdown,
            failed,
            config,
        }
    }

    /// Enqueue a sealed copy, applying the backpressure rule from spec §4.I:
    /// sleep proportionally once the queue exceeds `preferred_flush_queue_size`,
    /// and reject outright once it exceeds `maximum_map_size / flush_interval`.
    pub fn submit(&self, job: SealedCopy) -> VirtualMapResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(VirtualMapError::FatalIoError(
                "pipeline has already failed".to_string(),
            ));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(VirtualMapError::Cancelled);
        }

        let q = self.queue_depth.load(Ordering::Acquire);
        let max_q = (self.config.maximum_map_size / self.config.flush_interval.max(1)) as usize;
        if q > max_q {
            return Err(VirtualMapError::BackpressureExceeded);
        }
        if q > self.config.preferred_flush_queue_size {
            let excess = (q - self.config.preferred_flush_queue_size) as u32;
            let delay = std::cmp::min(self.config.step_size * excess, self.config.max_throttle_period);
            std::thread::sleep(delay);
        }

        self.queue_depth.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(job)
            .map_err(|_| VirtualMapError::Cancelled)
    }

    /// Block until every submitted copy up to and including `version` has
    /// been processed by the pipeline (spec §5 `waitUntilFlushed`: the
    /// pipeline has advanced past the caller's copy, not that this exact
    /// version is durable — a merge copy reaches `Done` without writing to
    /// disk; its data becomes durable when a later flush version processes).
    pub fn wait_until_flushed(&self, version: u64) -> VirtualMapResult<()> {
        let (lock, cvar) = &*self.flush_signal;
        let mut guard = lock.lock();
        while self.flushed_version.load(Ordering::Acquire) < version {
            if self.failed.load(Ordering::Acquire) {
                return Err(VirtualMapError::FatalIoError(
                    "pipeline failed before this version was flushed".to_string(),
                ));
            }
            cvar.wait(&mut guard);
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop accepting new copies and join the worker thread once it drains
    /// whatever is already queued (cancellation never interrupts a step that
    /// is already mid-hash or mid-flush, per spec §5).
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let (dummy_sender, _unused_receiver) = crossbeam_channel::unbounded();
        let old_sender = std::mem::replace(&mut self.sender, dummy_sender);
        drop(old_sender);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    receiver: Receiver<SealedCopy>,
    source: Arc<DataSource>,
    cache: Arc<VersionedCache>,
    hasher: Arc<Hasher>,
    config: VirtualMapConfig,
    queue_depth: Arc<AtomicUsize>,
    flushed_version: Arc<AtomicU64>,
    flush_signal: Arc<(Mutex<()>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    while let Ok(job) = receiver.recv() {
        if shutdown.load(Ordering::Acquire) {
            queue_depth.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        let version = job.version;
        match process_job(job, &source, &cache, &hasher, &config) {
            Ok(()) => {
                log::debug!("virtualmap: version {version} reached Done");
            }
            Err(e) => {
                log::error!("virtualmap: pipeline failed at version {version}: {e}");
                failed.store(true, Ordering::Release);
                let (lock, cvar) = &*flush_signal;
                let _guard = lock.lock();
                cvar.notify_all();
                queue_depth.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }

        // `waitUntilFlushed` (spec §5) means "the pipeline has advanced past
        // this copy", not "this copy is durable on disk" — a merge copy
        // reaches `Done` without writing anything, but callers waiting on it
        // still need to unblock. Durability for any given version is only
        // guaranteed once an enclosing flush version processes.
        flushed_version.fetch_max(version, Ordering::AcqRel);
        queue_depth.fetch_sub(1, Ordering::AcqRel);
        let (lock, cvar) = &*flush_signal;
        let _guard = lock.lock();
        cvar.notify_all();
    }
}

fn process_job(
    job: SealedCopy,
    source: &DataSource,
    cache: &VersionedCache,
    hasher: &Hasher,
    config: &VirtualMapConfig,
) -> VirtualMapResult<()> {
    let root = hasher.hash_version(
        job.version,
        &job.dirty_leaves,
        job.state.last_leaf_path,
        cache,
        source,
    )?;
    cache.seal(job.version);

    if job.version % config.flush_interval != 0 {
        // Merge copy: stays resident in the cache until a later flush
        // version folds it to disk.
        return Ok(());
    }

    let mut new_state = job.state;
    new_state.root_hash = Some(root);

    let drained = cache.drain_up_to(job.version);
    let mut internal_updates = Vec::new();
    let mut leaf_updates = Vec::new();
    for entry in drained {
        match entry.op {
            CacheOp::InternalHashInvalidated => {
                if let Some(h) = entry.hash {
                    internal_updates.push((entry.path, h));
                }
            }
            CacheOp::Put => leaf_updates.push(LeafUpdate::Put {
                path: entry.path,
                key: entry.key.unwrap_or_default(),
                value: entry.value.unwrap_or_default(),
                hash: entry.hash,
            }),
            CacheOp::Delete => match entry.key {
                Some(key) => leaf_updates.push(LeafUpdate::Delete {
                    path: entry.path,
                    key,
                }),
                None => leaf_updates.push(LeafUpdate::Vacate { path: entry.path }),
            },
        }
    }

    flush_with_retry(source, new_state, &internal_updates, &leaf_updates, config)?;
    cache.release_up_to(job.version);
    Ok(())
}

fn flush_with_retry(
    source: &DataSource,
    state: TreeState,
    internal_updates: &[(Path, crate::hash::Hash)],
    leaf_updates: &[LeafUpdate],
    config: &VirtualMapConfig,
) -> VirtualMapResult<()> {
    let mut attempt = 0u32;
    loop {
        match source.save_records(state.clone(), internal_updates, leaf_updates) {
            Ok(()) => return Ok(()),
            Err(VirtualMapError::IoError(e)) if attempt < config.io_retry_budget => {
                attempt += 1;
                let backoff = Duration::from_millis(50u64.saturating_mul(1 << attempt.min(10)));
                log::warn!("virtualmap: flush attempt {attempt} failed ({e}), retrying after {backoff:?}");
                std::thread::sleep(backoff);
            }
            Err(VirtualMapError::IoError(e)) => {
                return Err(VirtualMapError::FatalIoError(format!(
                    "flush failed after {attempt} retries: {e}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
