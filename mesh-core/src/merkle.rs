//! Balanced binary Merkle tree over leaf (key, value) pairs, grounded on
//! `TreeHasher` in the teacher's hashing module: sibling hashes are
//! combined by plain string concatenation, with no directional tag, so
//! proof verification is order-agnostic (lexicographic combining).

use crate::error::{MeshError, Result};
use std::collections::BTreeMap;

fn hash_leaf(key: &str, value: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(value);
    hasher.finalize().to_hex().to_string()
}

/// Combines two sibling hashes without regard to which was on the left or
/// right, so building bottom-up and verifying top-down agree regardless of
/// leaf index parity.
fn hash_pair(left: &str, right: &str) -> String {
    let (a, b) = if left <= right { (left, right) } else { (right, left) };
    blake3::hash(format!("{a}{b}").as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: String,
    pub sibling_hashes: Vec<String>,
    pub root_hash: String,
}

/// Leaves are kept sorted by key so two peers that hold the same set of
/// (key, value) pairs always build an identical tree, independent of
/// insertion order.
#[derive(Debug, Default, Clone)]
pub struct MerkleTree {
    leaves: BTreeMap<String, String>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: &[u8]) {
        let key = key.into();
        let hash = hash_leaf(&key, value);
        self.leaves.insert(key, hash);
    }

    pub fn remove(&mut self, key: &str) {
        self.leaves.remove(key);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    fn leaf_hashes(&self) -> Vec<String> {
        self.leaves.values().cloned().collect()
    }

    pub fn root(&self) -> Option<String> {
        let mut level = self.leaf_hashes();
        if level.is_empty() {
            return None;
        }
        while level.len() > 1 {
            level = Self::compute_parent_level(&level);
        }
        level.into_iter().next()
    }

    fn compute_parent_level(level: &[String]) -> Vec<String> {
        let mut parents = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            if i + 1 < level.len() {
                parents.push(hash_pair(&level[i], &level[i + 1]));
            } else {
                // Odd level: duplicate the last hash rather than leave it
                // unpaired.
                parents.push(hash_pair(&level[i], &level[i]));
            }
            i += 2;
        }
        parents
    }

    pub fn generate_proof(&self, key: &str) -> Option<MerkleProof> {
        let leaf_index = self.leaves.keys().position(|k| k == key)?;
        let leaf_hash = self.leaves.get(key)?.clone();
        let mut level = self.leaf_hashes();
        let mut index = leaf_index;
        let mut siblings = Vec::new();

        while level.len() > 1 {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = if sibling_index < level.len() {
                level[sibling_index].clone()
            } else {
                level[index].clone()
            };
            siblings.push(sibling);
            level = Self::compute_parent_level(&level);
            index /= 2;
        }

        Some(MerkleProof {
            leaf_index,
            leaf_hash,
            sibling_hashes: siblings,
            root_hash: level.into_iter().next()?,
        })
    }

    pub fn verify_proof(proof: &MerkleProof) -> bool {
        let mut current = proof.leaf_hash.clone();
        for sibling in &proof.sibling_hashes {
            current = hash_pair(&current, sibling);
        }
        current == proof.root_hash
    }
}

/// Computes the symmetric set difference between two sorted leaf-hash
/// digests, used by anti-entropy once two peers discover their roots
/// differ.
pub fn diff_leaf_keys(local: &MerkleTree, remote_keys: &[String]) -> Vec<String> {
    let remote: std::collections::HashSet<&String> = remote_keys.iter().collect();
    local
        .leaves
        .keys()
        .filter(|k| !remote.contains(k))
        .cloned()
        .collect()
}

pub fn require_root(tree: &MerkleTree, context: &str) -> Result<String> {
    tree.root().ok_or_else(|| MeshError::Configuration {
        field: "merkle.root".to_string(),
        value: "empty".to_string(),
        expected: format!("non-empty tree for {context}"),
    })
}
