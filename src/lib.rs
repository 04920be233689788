//! Disk-backed, copy-on-write, authenticated key-value store organized as a
//! binary Merkle tree.
//!
//! A [`VirtualMap`] is a versioned lineage of fast, O(1) logical copies: each
//! `copy()` call seals the current version and hands it to a background
//! pipeline that hashes it bottom-up and, every `flush_interval`-th version,
//! merges it down to durable log-structured files. See `DESIGN.md` for how
//! each module maps onto that lifecycle.

pub mod cache;
pub mod config;
pub mod datasource;
pub mod datastore;
pub mod errors;
pub mod hash;
pub mod hasher;
pub mod longlist;
pub mod path;
pub mod pipeline;
pub mod stats;
pub mod virtual_map;
pub mod wire;

pub use config::{ThreadBudget, VirtualMapConfig};
pub use errors::{VirtualMapError, VirtualMapResult};
pub use hash::{DigestAlgorithm, Hash};
pub use path::Path;
pub use stats::{MapStatistics, NoopStatistics};
pub use virtual_map::{CopyState, VirtualMap};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_put_copy_wait_and_reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        let config = VirtualMapConfig::new(dir.path())
            .with_bucket_count(16)
            .with_flush_interval(2);

        {
            let map: VirtualMap<Vec<u8>, Vec<u8>> =
                VirtualMap::open(config.clone()).unwrap();
            map.put(b"alice".to_vec(), b"100".to_vec()).unwrap();
            let sealed = map;
            let map = sealed.copy().unwrap();
            sealed.wait_until_flushed().unwrap();
            map.put(b"bob".to_vec(), b"200".to_vec()).unwrap();
            let sealed = map;
            let _next = sealed.copy().unwrap();
            sealed.wait_until_flushed().unwrap();
        }

        let reopened: VirtualMap<Vec<u8>, Vec<u8>> = VirtualMap::open(config).unwrap();
        assert_eq!(reopened.get(&b"alice".to_vec()).unwrap(), Some(b"100".to_vec()));
        assert_eq!(reopened.get(&b"bob".to_vec()).unwrap(), Some(b"200".to_vec()));
    }
}
