//! Merkle tree over artifact hashes.
//!
//! Leaves and interior nodes are domain separated: `H(0x00 || leaf)` and
//! `H(0x01 || left || right)`. A level with an odd count pairs its last node
//! with itself.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("merkle tree needs at least one leaf")]
    Empty,

    #[error("leaf {index} is not valid hex: {reason}")]
    InvalidLeaf { index: usize, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf: String,
    pub steps: Vec<ProofStep>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are hashed leaves, the last level holds the root.
    levels: Vec<Vec<[u8; 32]>>,
    leaves: Vec<String>,
}

fn hash_leaf(leaf: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(leaf);
    h.finalize().into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

fn decode_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

impl MerkleTree {
    /// Build a tree over hex-encoded leaf hashes, in the given order.
    pub fn from_hex_leaves<S: AsRef<str>>(leaves: &[S]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut level = Vec::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            let bytes = hex::decode(leaf.as_ref()).map_err(|e| MerkleError::InvalidLeaf {
                index,
                reason: e.to_string(),
            })?;
            level.push(hash_leaf(&bytes));
        }

        let mut levels = vec![level];
        while levels.last().map_or(0, Vec::len) > 1 {
            let prev = &levels[levels.len() - 1];
            let next: Vec<[u8; 32]> = prev
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }

        Ok(Self {
            levels,
            leaves: leaves.iter().map(|l| l.as_ref().to_string()).collect(),
        })
    }

    pub fn root(&self) -> String {
        // from_hex_leaves guarantees at least one level with one node
        self.levels
            .last()
            .and_then(|l| l.first())
            .map(hex::encode)
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        let leaf = self.leaves.get(leaf_index)?.clone();
        let mut steps = vec![];
        let mut idx = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            let sibling = level.get(sibling_idx).unwrap_or(&level[idx]);
            let side = if idx % 2 == 0 { Side::Right } else { Side::Left };
            steps.push(ProofStep {
                hash: hex::encode(sibling),
                side,
            });
            idx /= 2;
        }

        Some(MerkleProof {
            leaf_index,
            leaf,
            steps,
        })
    }
}

/// Check that `leaf` (hex) with `proof` hashes up to `root` (hex).
pub fn verify_proof(leaf: &str, proof: &MerkleProof, root: &str) -> bool {
    let Ok(leaf_bytes) = hex::decode(leaf) else {
        return false;
    };
    let mut acc = hash_leaf(&leaf_bytes);
    for step in &proof.steps {
        let Some(sibling) = decode_32(&step.hash) else {
            return false;
        };
        acc = match step.side {
            Side::Right => hash_pair(&acc, &sibling),
            Side::Left => hash_pair(&sibling, &acc),
        };
    }
    hex::encode(acc) == root.to_ascii_lowercase()
}
