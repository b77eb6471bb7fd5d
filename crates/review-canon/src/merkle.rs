//! Merkle tree over execution-proof hashes.
//!
//! Grounded on `bpi-merkle`'s binary tree (leaf/internal hashing, odd-level
//! duplication, bottom-up level storage, inclusion proofs) but generalized
//! to operate on the hex-string proof hashes the attestation layer already
//! produces rather than raw byte leaves, and hashed as `left|right` per the
//! execution contract instead of domain-separated blake3.

use crate::sha256_hex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("empty leaf set cannot produce a root")]
    EmptyTree,
    #[error("leaf index {index} out of bounds for {len} leaves")]
    IndexOutOfBounds { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProofStep {
    pub position: Side,
    pub hash: String,
}

fn parent_hash(left: &str, right: &str) -> String {
    sha256_hex(format!("{left}|{right}").as_bytes())
}

/// A Merkle tree rebuilt on demand from a chronological leaf sequence.
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn build(leaves: &[String]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }
        let mut levels = vec![leaves.to_vec()];
        let mut current = leaves.to_vec();
        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(parent_hash(left, right));
            }
            levels.push(next.clone());
            current = next;
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> String {
        self.levels.last().unwrap()[0].clone()
    }

    pub fn proof(&self, index: usize) -> Result<Vec<ProofStep>, MerkleError> {
        let leaf_count = self.levels[0].len();
        if index >= leaf_count {
            return Err(MerkleError::IndexOutOfBounds {
                index,
                len: leaf_count,
            });
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            let sibling = level.get(sibling_idx).unwrap_or(&level[idx]);
            let position = if idx % 2 == 0 { Side::Right } else { Side::Left };
            steps.push(ProofStep {
                position,
                hash: sibling.clone(),
            });
            idx /= 2;
        }
        Ok(steps)
    }
}

/// Build a tree from `leaves` and return its root. Convenience wrapper
/// around [`MerkleTree::build`] for callers that only need the root.
pub fn root(leaves: &[String]) -> Result<String, MerkleError> {
    Ok(MerkleTree::build(leaves)?.root())
}

/// Build a tree from `leaves` and return the inclusion proof for `index`.
pub fn proof(leaves: &[String], index: usize) -> Result<MerkleProof, MerkleError> {
    let tree = MerkleTree::build(leaves)?;
    Ok(MerkleProof {
        leaf_index: index,
        leaf_hash: leaves[index].clone(),
        steps: tree.proof(index)?,
    })
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    pub steps: Vec<ProofStep>,
}

/// Climb a leaf hash through its inclusion proof and compare against `root`.
pub fn verify(leaf: &str, steps: &[ProofStep], root: &str) -> bool {
    let mut current = leaf.to_string();
    for step in steps {
        current = match step.position {
            Side::Right => parent_hash(&current, &step.hash),
            Side::Left => parent_hash(&step.hash, &current),
        };
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(i: usize) -> String {
        sha256_hex(format!("leaf-{i}").as_bytes())
    }

    #[test]
    fn empty_is_error() {
        assert_eq!(root(&[]), Err(MerkleError::EmptyTree));
        assert_eq!(proof(&[], 0).unwrap_err(), MerkleError::EmptyTree);
    }

    #[test]
    fn single_leaf_is_its_own_root_with_empty_proof() {
        let leaves = vec![leaf(0)];
        let r = root(&leaves).unwrap();
        assert_eq!(r, leaves[0]);
        let p = proof(&leaves, 0).unwrap();
        assert!(p.steps.is_empty());
        assert!(verify(&p.leaf_hash, &p.steps, &r));
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        let leaves: Vec<String> = (0..3).map(leaf).collect();
        let tree = MerkleTree::build(&leaves).unwrap();
        let r = tree.root();
        for i in 0..3 {
            let p = tree.proof(i).unwrap();
            assert!(verify(&leaves[i], &p, &r));
        }
    }

    #[test]
    fn every_leaf_verifies_against_root() {
        let leaves: Vec<String> = (0..8).map(leaf).collect();
        let tree = MerkleTree::build(&leaves).unwrap();
        let r = tree.root();
        for i in 0..leaves.len() {
            let p = tree.proof(i).unwrap();
            assert!(verify(&leaves[i], &p, &r), "leaf {i} failed");
        }
    }

    #[test]
    fn out_of_bounds_index_errors() {
        let leaves = vec![leaf(0)];
        let tree = MerkleTree::build(&leaves).unwrap();
        assert_eq!(
            tree.proof(5),
            Err(MerkleError::IndexOutOfBounds { index: 5, len: 1 })
        );
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let leaves: Vec<String> = (0..4).map(leaf).collect();
        let tree = MerkleTree::build(&leaves).unwrap();
        let r = tree.root();
        let p = tree.proof(0).unwrap();
        assert!(!verify("not-the-leaf", &p, &r));
    }

    proptest! {
        #[test]
        fn rebuild_from_same_order_is_invariant(n in 1usize..40) {
            let leaves: Vec<String> = (0..n).map(leaf).collect();
            let r1 = root(&leaves).unwrap();
            let r2 = root(&leaves).unwrap();
            prop_assert_eq!(r1, r2);
        }

        #[test]
        fn all_proofs_valid_for_random_sizes(n in 1usize..60) {
            let leaves: Vec<String> = (0..n).map(leaf).collect();
            let tree = MerkleTree::build(&leaves).unwrap();
            let r = tree.root();
            for i in 0..n {
                let p = tree.proof(i).unwrap();
                prop_assert!(verify(&leaves[i], &p, &r));
            }
        }
    }
}
