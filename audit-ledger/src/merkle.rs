//! Merkle tree for inclusion proofs
//!
//! This module provides a batch-built tree and an incremental
//! (append-only) tree over the same hashing rules.
//!
//! # Design
//!
//! - Leaves are the digest of an item's canonical bytes
//! - Parents hash the concatenation of the children's hex digests
//! - An odd node at any level is paired with itself (duplicate-self)
//! - Proofs record the sibling and the side it sits on, leaf to root
//! - Both construction modes produce the same root for the same items

use crate::hashing::{canonical_json, CanonicalHasher, HashAlgorithm, HexDigest};
use crate::types::Entry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Something that can be placed in a Merkle tree
pub trait MerkleItem {
    /// Bytes hashed to form the leaf
    fn leaf_bytes(&self) -> Vec<u8>;

    /// Leaf digest under `algorithm`
    fn leaf_hash(&self, algorithm: HashAlgorithm) -> HexDigest {
        algorithm.hex_digest(&self.leaf_bytes())
    }
}

impl MerkleItem for str {
    fn leaf_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl MerkleItem for String {
    fn leaf_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl MerkleItem for Value {
    fn leaf_bytes(&self) -> Vec<u8> {
        match self {
            // Plain strings hash as themselves, not as quoted JSON
            Value::String(s) => s.as_bytes().to_vec(),
            other => canonical_json(other).into_bytes(),
        }
    }
}

/// Entries hash to their chain hash (given the ledger's algorithm)
impl MerkleItem for Entry {
    fn leaf_bytes(&self) -> Vec<u8> {
        canonical_json(&self.hash_input()).into_bytes()
    }
}

impl<T: MerkleItem + ?Sized> MerkleItem for &T {
    fn leaf_bytes(&self) -> Vec<u8> {
        (**self).leaf_bytes()
    }
}

/// Hash a pair of child digests
fn hash_pair(algorithm: HashAlgorithm, left: &HexDigest, right: &HexDigest) -> HexDigest {
    let mut joined = String::with_capacity(left.as_str().len() + right.as_str().len());
    joined.push_str(left.as_str());
    joined.push_str(right.as_str());
    algorithm.hex_digest(joined.as_bytes())
}

/// Side of the sibling relative to the node being proven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// Merkle proof (path from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Leaf hash being proven
    pub leaf_hash: HexDigest,
    /// Position of the leaf
    pub leaf_index: usize,
    /// Root of the tree the proof was generated from
    pub root_hash: HexDigest,
    /// Sibling hashes along the path to root
    pub proof_path: Vec<(HexDigest, Direction)>,
}

impl MerkleProof {
    /// Replay the path and compare with `root_hash`
    pub fn verify(&self, algorithm: HashAlgorithm) -> bool {
        let mut current = self.leaf_hash.clone();

        for (sibling, direction) in &self.proof_path {
            current = match direction {
                Direction::Left => hash_pair(algorithm, sibling, &current),
                Direction::Right => hash_pair(algorithm, &current, sibling),
            };
        }

        current == self.root_hash
    }
}

/// Outcome of checking several proofs against one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProofResult {
    /// Per-proof outcome, in input order
    pub results: Vec<bool>,
    /// Every proof verified
    pub all_valid: bool,
}

/// Verify multiple proofs against the same root.
///
/// A proof generated for a different root fails even if it is internally
/// consistent.
pub fn verify_batch_proofs(
    proofs: &[MerkleProof],
    expected_root: &HexDigest,
    algorithm: HashAlgorithm,
) -> BatchProofResult {
    let results: Vec<bool> = proofs
        .iter()
        .map(|proof| proof.root_hash == *expected_root && proof.verify(algorithm))
        .collect();
    let all_valid = results.iter().all(|ok| *ok);
    BatchProofResult { results, all_valid }
}

/// Merkle tree built once over a fixed item set
#[derive(Debug, Clone)]
pub struct MerkleTree {
    algorithm: HashAlgorithm,
    /// `levels[0]` holds the leaves, the last level holds the root
    levels: Vec<Vec<HexDigest>>,
    /// Leaf hash to first index holding it
    leaf_map: HashMap<HexDigest, usize>,
}

impl MerkleTree {
    /// Build over items; fails on an empty set
    pub fn build<I, T>(algorithm: HashAlgorithm, items: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: MerkleItem,
    {
        let leaves = items
            .into_iter()
            .map(|item| item.leaf_hash(algorithm))
            .collect();
        Self::from_leaf_hashes(algorithm, leaves)
    }

    /// Build over precomputed leaf hashes
    pub fn from_leaf_hashes(algorithm: HashAlgorithm, leaves: Vec<HexDigest>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::Validation(
                "Cannot build Merkle tree from empty data".to_string(),
            ));
        }

        let mut leaf_map = HashMap::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            leaf_map.entry(leaf.clone()).or_insert(index);
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last().filter(|level| level.len() > 1) {
            let next = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    hash_pair(algorithm, &pair[0], right)
                })
                .collect();
            levels.push(next);
        }

        Ok(Self {
            algorithm,
            levels,
            leaf_map,
        })
    }

    /// Hash algorithm
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Root hash
    pub fn root(&self) -> &HexDigest {
        // `levels` always ends in a single-node level
        &self.levels[self.levels.len() - 1][0]
    }

    /// Leaf hashes in order
    pub fn leaves(&self) -> &[HexDigest] {
        &self.levels[0]
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Always false: empty trees cannot be built
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Number of levels including leaves and root
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Index of the first leaf with this item's hash
    pub fn index_of<T: MerkleItem + ?Sized>(&self, item: &T) -> Option<usize> {
        self.leaf_map.get(&item.leaf_hash(self.algorithm)).copied()
    }

    /// Proof for an item; `None` if the item is not in the tree
    pub fn generate_proof<T: MerkleItem + ?Sized>(&self, item: &T) -> Option<MerkleProof> {
        self.generate_proof_at(self.index_of(item)?)
    }

    /// Proof for the leaf at `leaf_index`
    pub fn generate_proof_at(&self, leaf_index: usize) -> Option<MerkleProof> {
        let leaf_hash = self.levels[0].get(leaf_index)?.clone();
        let mut proof_path = Vec::with_capacity(self.levels.len() - 1);
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling, direction) = if index % 2 == 0 {
                // Last node of an odd level pairs with itself
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                (sibling.clone(), Direction::Right)
            } else {
                (level[index - 1].clone(), Direction::Left)
            };
            proof_path.push((sibling, direction));
            index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            leaf_index,
            root_hash: self.root().clone(),
            proof_path,
        })
    }

    /// Verify a proof with this tree's algorithm
    pub fn verify_proof(&self, proof: &MerkleProof) -> bool {
        proof.verify(self.algorithm)
    }

    /// Verify that a leaf with this hash sits at `leaf_index`
    pub fn verify_leaf(&self, leaf_index: usize, leaf_hash: &HexDigest) -> bool {
        if self.levels[0].get(leaf_index) != Some(leaf_hash) {
            return false;
        }

        self.generate_proof_at(leaf_index)
            .map(|proof| proof.root_hash == *self.root() && self.verify_proof(&proof))
            .unwrap_or(false)
    }
}

/// Append-only Merkle tree.
///
/// Only complete parents are stored; nodes still waiting for a right sibling
/// are combined on demand when the root is requested.
#[derive(Debug, Clone)]
pub struct IncrementalMerkleTree {
    algorithm: HashAlgorithm,
    levels: Vec<Vec<HexDigest>>,
}

impl IncrementalMerkleTree {
    /// Create empty tree
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            levels: vec![Vec::new()],
        }
    }

    /// Append an item, returning its leaf hash
    pub fn append<T: MerkleItem + ?Sized>(&mut self, item: &T) -> HexDigest {
        let leaf = item.leaf_hash(self.algorithm);
        self.append_leaf_hash(leaf.clone());
        leaf
    }

    /// Append a precomputed leaf hash
    pub fn append_leaf_hash(&mut self, leaf: HexDigest) {
        self.levels[0].push(leaf);

        // Walk up while the new node completes a pair
        let mut level = 0;
        while self.levels[level].len() % 2 == 0 {
            let nodes = &self.levels[level];
            let parent = hash_pair(
                self.algorithm,
                &nodes[nodes.len() - 2],
                &nodes[nodes.len() - 1],
            );
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            self.levels[level + 1].push(parent);
            level += 1;
        }
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Leaf hashes in order
    pub fn leaves(&self) -> &[HexDigest] {
        &self.levels[0]
    }

    /// Current root; `None` while empty
    pub fn root(&self) -> Option<HexDigest> {
        if self.is_empty() {
            return None;
        }

        let mut carry: Option<HexDigest> = None;
        let mut level = 0;
        loop {
            let stored: &[HexDigest] = self.levels.get(level).map(Vec::as_slice).unwrap_or(&[]);
            let count = stored.len() + usize::from(carry.is_some());

            if count == 1 {
                return carry.or_else(|| stored.first().cloned());
            }

            carry = match (stored.len() % 2 == 1, carry) {
                (true, Some(t)) => Some(hash_pair(self.algorithm, &stored[stored.len() - 1], &t)),
                (true, None) => {
                    let last = &stored[stored.len() - 1];
                    Some(hash_pair(self.algorithm, last, last))
                }
                (false, Some(t)) => Some(hash_pair(self.algorithm, &t, &t)),
                (false, None) => None,
            };
            level += 1;
        }
    }

    /// Batch tree over the current leaves, for proof generation
    pub fn snapshot(&self) -> Result<MerkleTree> {
        MerkleTree::from_leaf_hashes(self.algorithm, self.levels[0].clone())
    }
}

/// Leaf hashes for entries, reusing each entry's stored chain hash
pub fn entry_leaves<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Vec<HexDigest> {
    entries.into_iter().map(|entry| entry.hash.clone()).collect()
}

/// Tree over stored entries, leaf = entry hash
pub fn tree_for_entries(hasher: &CanonicalHasher, entries: &[Entry]) -> Result<MerkleTree> {
    MerkleTree::from_leaf_hashes(hasher.algorithm(), entry_leaves(entries))
}
