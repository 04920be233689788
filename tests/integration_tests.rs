use tempfile::TempDir;
use virtual_map::{VirtualMap, VirtualMapConfig, VirtualMapError};

type Map = VirtualMap<Vec<u8>, Vec<u8>>;

fn open(dir: &TempDir, flush_interval: u64) -> Map {
    VirtualMap::open(
        VirtualMapConfig::new(dir.path())
            .with_bucket_count(64)
            .with_flush_interval(flush_interval),
    )
    .unwrap()
}

/// Scenario 1: put three keys, commit, reload.
#[test]
fn three_puts_commit_reload() {
    let dir = TempDir::new().unwrap();
    let config = VirtualMapConfig::new(dir.path())
        .with_bucket_count(64)
        .with_flush_interval(1);

    {
        let map: Map = VirtualMap::open(config.clone()).unwrap();
        map.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        map.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        map.put(b"c".to_vec(), b"3".to_vec()).unwrap();

        assert_eq!(map.state().size, 3);
        assert_eq!(map.state().first_leaf_path, 2);
        assert_eq!(map.state().last_leaf_path, 4);

        // copy() seals `map` in place and hands it to the pipeline; wait on
        // `map` itself, not the fresh mutable copy it returns.
        let _next = map.copy().unwrap();
        map.wait_until_flushed().unwrap();

        assert_eq!(map.get(&b"a".to_vec()).unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.get(&b"b".to_vec()).unwrap(), Some(b"2".to_vec()));
        assert_eq!(map.get(&b"c".to_vec()).unwrap(), Some(b"3".to_vec()));
    }

    let reopened: Map = VirtualMap::open(config).unwrap();
    assert_eq!(reopened.state().size, 3);
    assert_eq!(reopened.get(&b"a".to_vec()).unwrap(), Some(b"1".to_vec()));
    assert_eq!(reopened.get(&b"b".to_vec()).unwrap(), Some(b"2".to_vec()));
    assert_eq!(reopened.get(&b"c".to_vec()).unwrap(), Some(b"3".to_vec()));
}

/// Scenario 2: put three keys, remove one, commit. Size shrinks by one and
/// the surviving keys remain reachable.
#[test]
fn put_three_remove_one_commit() {
    let dir = TempDir::new().unwrap();
    let map = open(&dir, 1);
    map.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    map.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    map.put(b"c".to_vec(), b"3".to_vec()).unwrap();

    let removed = map.remove(&b"a".to_vec()).unwrap();
    assert_eq!(removed, Some(b"1".to_vec()));

    let _next = map.copy().unwrap();
    map.wait_until_flushed().unwrap();

    assert_eq!(map.state().size, 2);
    assert!(map.get(&b"a".to_vec()).unwrap().is_none());
    assert_eq!(map.get(&b"b".to_vec()).unwrap(), Some(b"2".to_vec()));
    assert_eq!(map.get(&b"c".to_vec()).unwrap(), Some(b"3".to_vec()));
}

/// Scenario 3 (scaled down): many puts across several flush/merge boundaries,
/// final root hash stable across restart.
#[test]
fn many_puts_across_flush_boundaries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = VirtualMapConfig::new(dir.path())
        .with_bucket_count(256)
        .with_flush_interval(8);

    let keys: Vec<Vec<u8>> = (0u32..64).map(|i| i.to_be_bytes().to_vec()).collect();

    {
        let mut current: Map = VirtualMap::open(config.clone()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            current.put(key.clone(), key.clone()).unwrap();
            if i % 4 == 3 {
                current = current.copy().unwrap();
            }
        }
        let sealed = current;
        current = sealed.copy().unwrap();
        sealed.wait_until_flushed().unwrap();

        for key in &keys {
            assert_eq!(current.get(key).unwrap(), Some(key.clone()));
        }
    }

    let reopened: Map = VirtualMap::open(config).unwrap();
    assert_eq!(reopened.state().size as usize, keys.len());
    for key in &keys {
        assert_eq!(reopened.get(key).unwrap(), Some(key.clone()));
    }
}

/// Scenario 4: two lineages from the same base see independent values for
/// the same key until each is flushed.
#[test]
fn independent_copies_see_independent_values() {
    let dir = TempDir::new().unwrap();
    let v1 = open(&dir, 8);
    v1.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    let v2 = v1.copy().unwrap();
    v2.put(b"a".to_vec(), b"2".to_vec()).unwrap();

    assert_eq!(v1.get(&b"a".to_vec()).unwrap(), Some(b"1".to_vec()));
    assert_eq!(v2.get(&b"a".to_vec()).unwrap(), Some(b"2".to_vec()));
}

/// Scenario 5: backpressure throttles but never silently drops work, and the
/// pipeline eventually drains to a consistent, fully-flushed state.
#[test]
fn backpressure_throttles_but_pipeline_still_drains() {
    let dir = TempDir::new().unwrap();
    let config = VirtualMapConfig::new(dir.path())
        .with_bucket_count(64)
        .with_flush_interval(4)
        .with_preferred_flush_queue_size(2)
        .with_step_size(std::time::Duration::from_millis(1))
        .with_max_throttle_period(std::time::Duration::from_millis(20));

    let mut current: Map = VirtualMap::open(config).unwrap();
    for i in 0u32..40 {
        current
            .put(i.to_be_bytes().to_vec(), i.to_be_bytes().to_vec())
            .unwrap();
        current = current.copy().unwrap();
    }
    let sealed = current;
    current = sealed.copy().unwrap();
    sealed.wait_until_flushed().unwrap();

    for i in 0u32..40 {
        assert_eq!(
            current.get(&i.to_be_bytes().to_vec()).unwrap(),
            Some(i.to_be_bytes().to_vec())
        );
    }
}

/// Scenario 6: deleting a nonexistent key is a documented no-op by default,
/// and an explicit error when so configured, with no change to map size.
#[test]
fn delete_nonexistent_key_is_configurable() {
    let dir = TempDir::new().unwrap();
    let map = open(&dir, 1);
    map.put(b"a".to_vec(), b"1".to_vec()).unwrap();

    assert_eq!(map.remove(&b"ghost".to_vec()).unwrap(), None);
    assert_eq!(map.state().size, 1);

    let dir2 = TempDir::new().unwrap();
    let strict: Map = VirtualMap::open(
        VirtualMapConfig::new(dir2.path())
            .with_bucket_count(64)
            .with_remove_missing_is_error(true),
    )
    .unwrap();
    assert!(matches!(
        strict.remove(&b"ghost".to_vec()),
        Err(VirtualMapError::NotFound)
    ));
}

/// Boundary: the empty map has a fixed root hash, and removing the only leaf
/// returns to that same root hash.
#[test]
fn empty_map_and_single_leaf_round_trip_share_canonical_root() {
    let dir = TempDir::new().unwrap();
    let map = open(&dir, 1);
    assert_eq!(map.state().size, 0);
    let next = map.copy().unwrap();
    map.wait_until_flushed().unwrap();
    let empty_root = map.root_hash().unwrap();

    next.put(b"only".to_vec(), b"1".to_vec()).unwrap();
    next.remove(&b"only".to_vec()).unwrap();
    assert_eq!(next.state().size, 0);

    let _after = next.copy().unwrap();
    next.wait_until_flushed().unwrap();
    assert_eq!(next.root_hash().unwrap(), empty_root);
}

/// Idempotence: repeating an identical put does not change observable state.
#[test]
fn repeated_identical_put_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let map = open(&dir, 1);
    map.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    map.put(b"k".to_vec(), b"v".to_vec()).unwrap();
    assert_eq!(map.state().size, 1);
    assert_eq!(map.get(&b"k".to_vec()).unwrap(), Some(b"v".to_vec()));
}

/// Merge invariance: after folding several merge copies into a flush, every
/// previously-written leaf is still readable by path-independent key lookup.
#[test]
fn merge_preserves_every_live_key() {
    let dir = TempDir::new().unwrap();
    let config = VirtualMapConfig::new(dir.path())
        .with_bucket_count(128)
        .with_flush_interval(4)
        .with_merge_max_files(2);

    let mut current: Map = VirtualMap::open(config).unwrap();
    for i in 0u32..20 {
        current
            .put(i.to_be_bytes().to_vec(), i.to_be_bytes().to_vec())
            .unwrap();
        current = current.copy().unwrap();
    }
    let sealed = current;
    current = sealed.copy().unwrap();
    sealed.wait_until_flushed().unwrap();

    let _ = current.merge_leaves().unwrap();
    let _ = current.merge_internals().unwrap();

    for i in 0u32..20 {
        assert_eq!(
            current.get(&i.to_be_bytes().to_vec()).unwrap(),
            Some(i.to_be_bytes().to_vec())
        );
    }
}
