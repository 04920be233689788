//! Digest abstraction. The map is generic over which hash function is used to
//! derive leaf hashes and combine internal-node hashes; the algorithm is a
//! collaborator parameter selected via [`DigestAlgorithm`] and carried in
//! [`crate::config::VirtualMapConfig`].

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384};

/// Which digest algorithm a map instance was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Blake3,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        DigestAlgorithm::Sha256
    }
}

impl DigestAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Blake3 => 32,
        }
    }
}

/// A digest output. Stored as a length-tagged byte buffer so records with
/// differently sized hashes (SHA-256/BLAKE3 at 32 bytes, SHA-384 at 48) share
/// one wire representation (spec §6: `hash_len:u8 | hash_bytes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash(pub Vec<u8>);

impl Hash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Hash arbitrary bytes with the configured algorithm.
pub fn hash_bytes(algo: DigestAlgorithm, input: &[u8]) -> Hash {
    match algo {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(input);
            Hash(hasher.finalize().to_vec())
        }
        DigestAlgorithm::Sha384 => {
            let mut hasher = Sha384::new();
            hasher.update(input);
            Hash(hasher.finalize().to_vec())
        }
        DigestAlgorithm::Blake3 => Hash(blake3::hash(input).as_bytes().to_vec()),
    }
}

/// Combine two child hashes into their parent's hash:
/// `H(hash(left) || hash(right))`.
pub fn hash_pair(algo: DigestAlgorithm, left: &Hash, right: &Hash) -> Hash {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(&left.0);
    data.extend_from_slice(&right.0);
    hash_bytes(algo, &data)
}

/// Hash of an empty input, used as the level-0 zero hash.
pub fn zero_leaf_hash(algo: DigestAlgorithm) -> Hash {
    hash_bytes(algo, &[0u8])
}

/// Precompute the canonical zero-hash ladder up to `levels` (inclusive),
/// `zero[0]` is the hash of an absent leaf, `zero[i+1] = hash_pair(zero[i], zero[i])`.
pub fn zero_hash_ladder(algo: DigestAlgorithm, levels: u32) -> Vec<Hash> {
    let mut ladder = Vec::with_capacity(levels as usize + 1);
    ladder.push(zero_leaf_hash(algo));
    for i in 0..levels {
        let next = hash_pair(algo, &ladder[i as usize], &ladder[i as usize]);
        ladder.push(next);
    }
    ladder
}

/// The canonical empty-tree root: the hash of a tree with no live leaves, per
/// spec §8 ("The empty map has a fixed, documented root hash.").
pub fn empty_tree_root(algo: DigestAlgorithm) -> Hash {
    zero_leaf_hash(algo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_and_blake3_differ() {
        let a = hash_bytes(DigestAlgorithm::Sha256, b"hello");
        let b = hash_bytes(DigestAlgorithm::Blake3, b"hello");
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
    }

    #[test]
    fn sha384_output_is_48_bytes() {
        let h = hash_bytes(DigestAlgorithm::Sha384, b"hello");
        assert_eq!(h.len(), 48);
    }

    #[test]
    fn empty_root_is_deterministic() {
        let a = empty_tree_root(DigestAlgorithm::Sha256);
        let b = empty_tree_root(DigestAlgorithm::Sha256);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_ladder_matches_hash_pair() {
        let ladder = zero_hash_ladder(DigestAlgorithm::Sha256, 3);
        assert_eq!(ladder.len(), 4);
        let expected = hash_pair(DigestAlgorithm::Sha256, &ladder[0], &ladder[0]);
        assert_eq!(ladder[1], expected);
    }
}
