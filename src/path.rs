//! Path arithmetic over the complete binary tree addressed by `u64`s.
//!
//! Root is path `0`. Children of `p` are `2p+1` and `2p+2`; parent is
//! `(p-1)/2`; level is `floor(log2(p+1))`. These functions are pure and total
//! except where the tree has no defined answer (`parent(0)`, any operation on
//! `u64::MAX`), in which case `VirtualMapError::PathOverflow` is returned.

use crate::errors::{VirtualMapError, VirtualMapResult};

/// A node address in the complete binary tree. Root is `Path(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(pub u64);

impl Path {
    pub const ROOT: Path = Path(0);

    #[inline]
    pub fn new(p: u64) -> Self {
        Path(p)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Path {
    fn from(v: u64) -> Self {
        Path(v)
    }
}

impl From<Path> for u64 {
    fn from(p: Path) -> Self {
        p.0
    }
}

/// `true` if `p` is the left child of its parent (odd paths are left children).
#[inline]
pub fn is_left_child(p: Path) -> bool {
    (p.0 & 1) == 1
}

/// `true` if `p` is the right child of its parent. The root has no parent and
/// is neither a left nor a right child.
#[inline]
pub fn is_right_child(p: Path) -> bool {
    (p.0 & 1) == 0 && p.0 > 0
}

/// Parent of `p`. Undefined (and rejected) for the root.
#[inline]
pub fn parent(p: Path) -> VirtualMapResult<Path> {
    if p.0 == 0 {
        return Err(VirtualMapError::PathOverflow);
    }
    Ok(Path((p.0 - 1) / 2))
}

/// Left child of `p`, i.e. `2p + 1`.
#[inline]
pub fn left_child(p: Path) -> VirtualMapResult<Path> {
    p.0.checked_mul(2)
        .and_then(|v| v.checked_add(1))
        .map(Path)
        .ok_or(VirtualMapError::PathOverflow)
}

/// Right child of `p`, i.e. `2p + 2`.
#[inline]
pub fn right_child(p: Path) -> VirtualMapResult<Path> {
    p.0.checked_mul(2)
        .and_then(|v| v.checked_add(2))
        .map(Path)
        .ok_or(VirtualMapError::PathOverflow)
}

/// The level (depth from the root, root is level 0) that `p` lies on:
/// `floor(log2(p+1))`.
#[inline]
pub fn level(p: Path) -> VirtualMapResult<u32> {
    if p.0 == u64::MAX {
        return Err(VirtualMapError::PathOverflow);
    }
    Ok(63 - (p.0 + 1).leading_zeros())
}

/// The 0-based index of `p` within its level:
/// `p - (2^level(p) - 1)`.
#[inline]
pub fn path_in_level(p: Path) -> VirtualMapResult<u64> {
    let lvl = level(p)?;
    Ok(p.0 - ((1u64 << lvl) - 1))
}

/// Sibling of `p` (the other child of `p`'s parent). Undefined for the root.
#[inline]
pub fn sibling(p: Path) -> VirtualMapResult<Path> {
    if p.0 == 0 {
        return Err(VirtualMapError::PathOverflow);
    }
    if is_left_child(p) {
        Ok(Path(p.0 + 1))
    } else {
        Ok(Path(p.0 - 1))
    }
}

/// First path on level `lvl` (i.e. `2^lvl - 1`).
#[inline]
pub fn first_path_on_level(lvl: u32) -> VirtualMapResult<Path> {
    1u64.checked_shl(lvl)
        .and_then(|v| v.checked_sub(1))
        .map(Path)
        .ok_or(VirtualMapError::PathOverflow)
}

/// The leftmost leaf reachable from `p`, given a tree whose deepest
/// populated level is `deepest_level`. For `p` already on `deepest_level`
/// this returns `p` itself.
pub fn leftmost_leaf(p: Path, deepest_level: u32) -> VirtualMapResult<Path> {
    let p_level = level(p)?;
    if p_level > deepest_level {
        return Err(VirtualMapError::PathOverflow);
    }
    let depth_diff = deepest_level - p_level;
    let index_in_level = path_in_level(p)?;
    let first_of_deepest = first_path_on_level(deepest_level)?;
    Ok(Path(
        first_of_deepest.0 + (index_in_level << depth_diff),
    ))
}

/// The rightmost leaf reachable from `p`, given a tree whose deepest
/// populated level is `deepest_level`.
pub fn rightmost_leaf(p: Path, deepest_level: u32) -> VirtualMapResult<Path> {
    let p_level = level(p)?;
    if p_level > deepest_level {
        return Err(VirtualMapError::PathOverflow);
    }
    let depth_diff = deepest_level - p_level;
    let index_in_level = path_in_level(p)?;
    let span = (1u64 << depth_diff) - 1;
    let first_of_deepest = first_path_on_level(deepest_level)?;
    Ok(Path(
        first_of_deepest.0 + (index_in_level << depth_diff) + span,
    ))
}
