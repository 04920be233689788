//! Bottom-up ancestor hashing for one version's dirty leaf set (spec §4.J).
//! Grounded on the teacher's `compute_zero_hashes` base case and its
//! recursive `hash_pair` folding, parallelized level by level with a
//! manually bounded thread pool the way the pack's worker-pool idioms size
//! off `num_cpus` rather than pulling in `rayon`.
//!
//! The tree's leaves can span two adjacent levels at once (a `put` leaves
//! the newly split pair one level deeper than every other leaf; a `remove`
//! can leave the folded-back sibling a level shallower than the leaf it
//! swapped against). `hash_version` therefore drives the climb off the
//! *maximum remaining level in the dirty frontier* rather than a single
//! shared level counter, so a deeper pair converges with a shallower one
//! only once they reach the same ancestor level. See DESIGN.md.

use std::collections::BTreeSet;

use crate::cache::VersionedCache;
use crate::datasource::DataSource;
use crate::errors::VirtualMapResult;
use crate::hash::{self, DigestAlgorithm, Hash};
use crate::path::{self, Path};

pub struct Hasher {
    digest: DigestAlgorithm,
    threads: usize,
}

impl Hasher {
    pub fn new(digest: DigestAlgorithm, threads: usize) -> Self {
        Self {
            digest,
            threads: threads.max(1),
        }
    }

    pub fn empty_root(&self) -> Hash {
        hash::empty_tree_root(self.digest)
    }

    /// Recompute every internal hash on the path from `dirty_leaves` to the
    /// root for `version`, writing each one into `cache` via
    /// [`VersionedCache::invalidate_internal`], and return the new root hash.
    pub fn hash_version(
        &self,
        version: u64,
        dirty_leaves: &[Path],
        last_leaf_path: i64,
        cache: &VersionedCache,
        source: &DataSource,
    ) -> VirtualMapResult<Hash> {
        if last_leaf_path < 0 {
            return Ok(self.empty_root());
        }
        if dirty_leaves.is_empty() {
            return Ok(cache
                .lookup_by_path(Path::ROOT, version)
                .and_then(|e| e.hash)
                .unwrap_or_else(|| self.empty_root()));
        }

        let deepest_level = path::level(Path::new(last_leaf_path as u64))?;
        let zero_ladder = hash::zero_hash_ladder(self.digest, deepest_level + 1);

        let mut frontier: BTreeSet<u64> = dirty_leaves.iter().map(|p| p.get()).collect();

        loop {
            let pending: Vec<u64> = frontier.iter().copied().filter(|&p| p != 0).collect();
            if pending.is_empty() {
                break;
            }

            let mut max_level = 0u32;
            let mut levels = Vec::with_capacity(pending.len());
            for &p in &pending {
                let lvl = path::level(Path::new(p))?;
                max_level = max_level.max(lvl);
                levels.push(lvl);
            }

            let mut at_max = BTreeSet::new();
            for (&p, lvl) in pending.iter().zip(levels) {
                if lvl == max_level {
                    at_max.insert(p);
                    frontier.remove(&p);
                }
            }

            let mut parents = BTreeSet::new();
            for p in &at_max {
                parents.insert(path::parent(Path::new(*p))?.get());
            }
            self.compute_parents(
                &parents,
                max_level - 1,
                deepest_level,
                version,
                cache,
                source,
                &zero_ladder,
            )?;
            frontier.extend(parents);
        }

        Ok(cache
            .lookup_by_path(Path::ROOT, version)
            .and_then(|e| e.hash)
            .unwrap_or_else(|| self.empty_root()))
    }

    fn compute_parents(
        &self,
        parents: &BTreeSet<u64>,
        parent_level: u32,
        deepest_level: u32,
        version: u64,
        cache: &VersionedCache,
        source: &DataSource,
        zero_ladder: &[Hash],
    ) -> VirtualMapResult<()> {
        let ordered: Vec<u64> = parents.iter().copied().collect();
        if ordered.is_empty() {
            return Ok(());
        }
        let worker_count = self.threads.min(ordered.len()).max(1);
        let chunk_size = (ordered.len() + worker_count - 1) / worker_count;

        std::thread::scope(|scope| -> VirtualMapResult<()> {
            let mut handles = Vec::new();
            for chunk in ordered.chunks(chunk_size) {
                let handle = scope.spawn(move || -> VirtualMapResult<()> {
                    for &p in chunk {
                        let parent = Path::new(p);
                        let left = path::left_child(parent)?;
                        let right = path::right_child(parent)?;
                        let left_hash = self.child_hash(
                            left,
                            parent_level + 1,
                            deepest_level,
                            version,
                            cache,
                            source,
                            zero_ladder,
                        )?;
                        let right_hash = self.child_hash(
                            right,
                            parent_level + 1,
                            deepest_level,
                            version,
                            cache,
                            source,
                            zero_ladder,
                        )?;
                        let combined = hash::hash_pair(self.digest, &left_hash, &right_hash);
                        cache.invalidate_internal(version, parent, combined);
                    }
                    Ok(())
                });
                handles.push(handle);
            }
            for handle in handles {
                handle.join().map_err(|_| {
                    crate::errors::VirtualMapError::HashingFailed(
                        "hashing worker thread panicked".to_string(),
                    )
                })??;
            }
            Ok(())
        })
    }

    fn child_hash(
        &self,
        child: Path,
        child_level: u32,
        deepest_level: u32,
        version: u64,
        cache: &VersionedCache,
        source: &DataSource,
        zero_ladder: &[Hash],
    ) -> VirtualMapResult<Hash> {
        if let Some(entry) = cache.lookup_by_path(child, version) {
            if let Some(h) = entry.hash {
                return Ok(h);
            }
        }
        if let Some(leaf) = source.find_leaf_by_path(child)? {
            if let Some(h) = leaf.hash {
                return Ok(h);
            }
        }
        if let Some(h) = source.find_internal_hash(child)? {
            return Ok(h);
        }
        let distance = (deepest_level - child_level) as usize;
        Ok(zero_ladder[distance].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VirtualMapConfig;
    use crate::datasource::LeafUpdate;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> DataSource {
        DataSource::open(&VirtualMapConfig::new(dir.path()).with_bucket_count(16)).unwrap()
    }

    #[test]
    fn single_leaf_tree_roots_at_its_own_hash() {
        let dir = TempDir::new().unwrap();
        let ds = source(&dir);
        let leaf_hash = hash::hash_bytes(DigestAlgorithm::Sha256, b"alice:100");
        let cache = VersionedCache::new();
        cache.put_leaf(1, Path::ROOT, b"alice".to_vec(), b"100".to_vec(), Some(leaf_hash.clone()));

        let hasher = Hasher::new(DigestAlgorithm::Sha256, 2);
        let root = hasher
            .hash_version(1, &[Path::ROOT], 0, &cache, &ds)
            .unwrap();
        assert_eq!(root, leaf_hash);
    }

    #[test]
    fn two_leaf_tree_combines_sibling_hashes() {
        let dir = TempDir::new().unwrap();
        let ds = source(&dir);
        let left_hash = hash::hash_bytes(DigestAlgorithm::Sha256, b"a");
        let right_hash = hash::hash_bytes(DigestAlgorithm::Sha256, b"b");
        let cache = VersionedCache::new();
        cache.put_leaf(1, Path::new(1), b"a".to_vec(), b"a".to_vec(), Some(left_hash.clone()));
        cache.put_leaf(1, Path::new(2), b"b".to_vec(), b"b".to_vec(), Some(right_hash.clone()));

        let hasher = Hasher::new(DigestAlgorithm::Sha256, 2);
        let root = hasher
            .hash_version(1, &[Path::new(1), Path::new(2)], 2, &cache, &ds)
            .unwrap();
        let expected = hash::hash_pair(DigestAlgorithm::Sha256, &left_hash, &right_hash);
        assert_eq!(root, expected);
    }

    #[test]
    fn empty_tree_returns_canonical_root() {
        let dir = TempDir::new().unwrap();
        let ds = source(&dir);
        let cache = VersionedCache::new();
        let hasher = Hasher::new(DigestAlgorithm::Sha256, 2);
        let root = hasher.hash_version(1, &[], -1, &cache, &ds).unwrap();
        assert_eq!(root, hash::empty_tree_root(DigestAlgorithm::Sha256));
    }

    #[test]
    fn missing_sibling_falls_back_to_zero_ladder() {
        let dir = TempDir::new().unwrap();
        let ds = source(&dir);
        let left_hash = hash::hash_bytes(DigestAlgorithm::Sha256, b"only");
        let cache = VersionedCache::new();
        cache.put_leaf(1, Path::new(1), b"only".to_vec(), b"x".to_vec(), Some(left_hash.clone()));

        let hasher = Hasher::new(DigestAlgorithm::Sha256, 2);
        let root = hasher
            .hash_version(1, &[Path::new(1)], 2, &cache, &ds)
            .unwrap();
        let zero_leaf = hash::zero_leaf_hash(DigestAlgorithm::Sha256);
        let expected = hash::hash_pair(DigestAlgorithm::Sha256, &left_hash, &zero_leaf);
        assert_eq!(root, expected);
    }
}
