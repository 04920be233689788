use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{VirtualMapError, VirtualMapResult};
use crate::hash::DigestAlgorithm;
use crate::stats::{MapStatistics, NoopStatistics};

/// Either an absolute thread count or a percentage of available cores,
/// resolved at construction time (spec §6: `numHashThreads or percentHashThreads`).
#[derive(Debug, Clone, Copy)]
pub enum ThreadBudget {
    Count(usize),
    PercentOfCores(u8),
}

impl ThreadBudget {
    pub fn resolve(self) -> usize {
        match self {
            ThreadBudget::Count(n) => n.max(1),
            ThreadBudget::PercentOfCores(pct) => {
                let cores = num_cpus::get();
                ((cores * pct as usize) / 100).max(1)
            }
        }
    }
}

impl Default for ThreadBudget {
    fn default() -> Self {
        ThreadBudget::PercentOfCores(50)
    }
}

/// Full configuration for a [`crate::virtual_map::VirtualMap`] instance.
/// Every field enumerated in spec §6 plus the ambient `data_dir` and
/// `remove_missing_is_error` ("whether `remove` on a missing key is an error
/// or a silent no-op", resolved explicitly here per spec §9's open question).
#[derive(Clone)]
pub struct VirtualMapConfig {
    /// Directory the map's files live under.
    pub data_dir: PathBuf,
    /// Every `flush_interval`-th sealed version is written to disk directly;
    /// the others are folded ("merged") into their successor.
    pub flush_interval: u64,
    /// Target depth of the sealed-but-not-yet-flushed queue before `copy()`
    /// starts throttling.
    pub preferred_flush_queue_size: usize,
    /// Per-excess-unit throttle delay applied to `copy()` once the queue
    /// exceeds `preferred_flush_queue_size`.
    pub step_size: Duration,
    /// Upper bound on the throttle delay from a single `copy()` call.
    pub max_throttle_period: Duration,
    /// Hard cap on outstanding (unflushed) versions, expressed as a leaf
    /// count; `copy()` fails with `BackpressureExceeded` once
    /// `queue_depth > maximum_map_size / flush_interval`.
    pub maximum_map_size: u64,
    /// Worker pool size for hashing.
    pub hash_threads: ThreadBudget,
    /// Worker pool size for the HDHM/file-set cleaner threads.
    pub cleaner_threads: ThreadBudget,
    /// Maximum number of sealed files a single merge pass may fold together.
    pub merge_max_files: usize,
    /// Soft byte-size threshold bounding how large a merge prefix may grow.
    pub merge_target_bytes: u64,
    /// Digest algorithm used for leaf and internal-node hashes.
    pub digest: DigestAlgorithm,
    /// HDHM bucket array size; must be a power of two.
    pub bucket_count: u32,
    /// `true`: `remove()` on a missing key returns `NotFound`.
    /// `false`: it is a silent no-op.
    pub remove_missing_is_error: bool,
    /// Page cache budget in bytes for the path→location indexes.
    pub cache_size_bytes: usize,
    /// Whether to keep a write-ahead log for the in-progress version.
    pub enable_wal: bool,
    /// How many consecutive flush I/O failures to retry (with exponential
    /// backoff) before escalating to `FatalIoError` and failing the pipeline.
    pub io_retry_budget: u32,
    /// Metrics sink; defaults to a no-op.
    pub stats: Arc<dyn MapStatistics>,
}

impl VirtualMapConfig {
    /// A configuration with the spec's suggested defaults.
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            flush_interval: 8,
            preferred_flush_queue_size: 2,
            step_size: Duration::from_millis(1),
            max_throttle_period: Duration::from_millis(500),
            maximum_map_size: 1 << 34,
            hash_threads: ThreadBudget::default(),
            cleaner_threads: ThreadBudget::PercentOfCores(25),
            merge_max_files: 8,
            merge_target_bytes: 64 * 1024 * 1024,
            digest: DigestAlgorithm::Sha256,
            bucket_count: 1 << 16,
            remove_missing_is_error: false,
            cache_size_bytes: 1024 * 1024,
            enable_wal: true,
            io_retry_budget: 5,
            stats: Arc::new(NoopStatistics),
        }
    }

    /// Validate invariants that aren't enforceable through the type system
    /// alone (bucket count must be a power of two, flush interval nonzero).
    pub fn validate(&self) -> VirtualMapResult<()> {
        if self.flush_interval == 0 {
            return Err(VirtualMapError::ConfigurationError(
                "flush_interval must be > 0".to_string(),
            ));
        }
        if self.preferred_flush_queue_size == 0 {
            return Err(VirtualMapError::ConfigurationError(
                "preferred_flush_queue_size must be > 0".to_string(),
            ));
        }
        if !self.bucket_count.is_power_of_two() {
            return Err(VirtualMapError::ConfigurationError(
                "bucket_count must be a power of two".to_string(),
            ));
        }
        if self.merge_max_files <= 1 {
            return Err(VirtualMapError::ConfigurationError(
                "merge_max_files must be > 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_flush_interval(mut self, n: u64) -> Self {
        self.flush_interval = n;
        self
    }

    pub fn with_preferred_flush_queue_size(mut self, n: usize) -> Self {
        self.preferred_flush_queue_size = n;
        self
    }

    pub fn with_step_size(mut self, d: Duration) -> Self {
        self.step_size = d;
        self
    }

    pub fn with_max_throttle_period(mut self, d: Duration) -> Self {
        self.max_throttle_period = d;
        self
    }

    pub fn with_maximum_map_size(mut self, n: u64) -> Self {
        self.maximum_map_size = n;
        self
    }

    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_bucket_count(mut self, n: u32) -> Self {
        self.bucket_count = n;
        self
    }

    pub fn with_remove_missing_is_error(mut self, v: bool) -> Self {
        self.remove_missing_is_error = v;
        self
    }

    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    pub fn with_wal(mut self, enable: bool) -> Self {
        self.enable_wal = enable;
        self
    }

    pub fn with_merge_max_files(mut self, n: usize) -> Self {
        self.merge_max_files = n;
        self
    }

    pub fn with_merge_target_bytes(mut self, n: u64) -> Self {
        self.merge_target_bytes = n;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn MapStatistics>) -> Self {
        self.stats = stats;
        self
    }

    /// Configuration optimized for local development: no WAL, small caches,
    /// aggressive flushing.
    pub fn development<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self::new(data_dir)
            .with_cache_size(256 * 1024)
            .with_wal(false)
            .with_flush_interval(4)
    }

    /// Configuration optimized for production durability.
    pub fn production<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self::new(data_dir)
            .with_cache_size(4 * 1024 * 1024)
            .with_wal(true)
    }
}

impl std::fmt::Debug for VirtualMapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMapConfig")
            .field("data_dir", &self.data_dir)
            .field("flush_interval", &self.flush_interval)
            .field("preferred_flush_queue_size", &self.preferred_flush_queue_size)
            .field("maximum_map_size", &self.maximum_map_size)
            .field("digest", &self.digest)
            .field("bucket_count", &self.bucket_count)
            .field("remove_missing_is_error", &self.remove_missing_is_error)
            .field("enable_wal", &self.enable_wal)
            .finish()
    }
}

impl Default for VirtualMapConfig {
    fn default() -> Self {
        Self::new("./virtual_map_data")
    }
}
