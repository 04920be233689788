use proptest::prelude::*;
use virtual_map::path;
use virtual_map::Path;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// **Property**: every non-root path's children report it back as their parent.
    #[test]
    fn prop_children_roundtrip_to_parent(raw in 0u64..(1u64 << 40)) {
        let p = Path::new(raw);
        let left = path::left_child(p).unwrap();
        let right = path::right_child(p).unwrap();
        prop_assert_eq!(path::parent(left).unwrap(), p);
        prop_assert_eq!(path::parent(right).unwrap(), p);
    }

    /// **Property**: sibling is its own inverse for every non-root path.
    #[test]
    fn prop_sibling_is_involution(raw in 1u64..(1u64 << 40)) {
        let p = Path::new(raw);
        prop_assert_eq!(path::sibling(path::sibling(p).unwrap()).unwrap(), p);
    }

    /// **Property**: exactly one of a path's two children reports `is_left_child`.
    #[test]
    fn prop_exactly_one_child_is_left(raw in 0u64..(1u64 << 40)) {
        let p = Path::new(raw);
        let left = path::left_child(p).unwrap();
        let right = path::right_child(p).unwrap();
        prop_assert!(path::is_left_child(left) && !path::is_left_child(right));
        prop_assert!(path::is_right_child(right) && !path::is_right_child(left));
    }

    /// **Property**: a path's level is always exactly one deeper than its parent's.
    #[test]
    fn prop_level_increases_by_one_per_child(raw in 0u64..(1u64 << 40)) {
        let p = Path::new(raw);
        let parent_level = path::level(p).unwrap();
        let left = path::left_child(p).unwrap();
        let right = path::right_child(p).unwrap();
        prop_assert_eq!(path::level(left).unwrap(), parent_level + 1);
        prop_assert_eq!(path::level(right).unwrap(), parent_level + 1);
    }

    /// **Property**: `leftmost_leaf`/`rightmost_leaf` always land on `deepest_level`
    /// and bracket every leaf reachable from `p` in ascending order.
    #[test]
    fn prop_leaf_span_lands_on_deepest_level(
        level in 0u32..12,
        index in 0u64..4096,
        extra_depth in 0u32..8,
    ) {
        let first_on_level = path::first_path_on_level(level).unwrap();
        let span = 1u64 << level;
        let p = Path::new(first_on_level.get() + (index % span));
        let deepest = level + extra_depth;

        let leftmost = path::leftmost_leaf(p, deepest).unwrap();
        let rightmost = path::rightmost_leaf(p, deepest).unwrap();

        prop_assert_eq!(path::level(leftmost).unwrap(), deepest);
        prop_assert_eq!(path::level(rightmost).unwrap(), deepest);
        prop_assert!(leftmost.get() <= rightmost.get());
    }
}
