//! BLAKE3 Merkle hashing for the state commitments.
//!
//! Uses domain-separated hashing to prevent second-preimage attacks:
//! - Leaf hash: `BLAKE3(0x00 || data)`
//! - Internal node: `BLAKE3(0x01 || left || right)`
//!
//! Three consumers share these primitives: the accumulator roots (balanced
//! tree over sorted leaves, odd layers padded by duplication), the pairwise
//! [`interpret`] fold that binds the roots into a definition hash, and the
//! append-only [`CompactMmr`] over header hashes.

use crate::types::Hash256;

/// Domain separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for internal node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `BLAKE3(0x00 || data)`.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated internal node hash: `BLAKE3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Fold `other` into `acc`, with `other` taken as the right sibling when
/// `other_on_right` is set.
///
/// This is the combining step of the definition hash:
/// `interpret(interpret(utxo_root, kernel_root, true), history_root, false)`.
pub fn interpret(acc: Hash256, other: Hash256, other_on_right: bool) -> Hash256 {
    if other_on_right {
        node_hash(&acc, &other)
    } else {
        node_hash(&other, &acc)
    }
}

/// Compute the Merkle root from a slice of leaf values.
///
/// Returns [`Hash256::ZERO`] for an empty slice. Odd-length layers are
/// padded by duplicating the last element.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();

    while current.len() > 1 {
        current = next_layer(&current);
    }

    current[0]
}

/// Compute the next layer of the tree from the current one.
fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = if i + 1 < layer.len() {
            &layer[i + 1]
        } else {
            left
        };
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

/// Append-only Merkle mountain range, storing only the peak hashes.
///
/// Used for the header-history commitment: the processor appends each
/// active header hash in height order and reads the bagged root. Two MMRs
/// fed the same sequence produce the same root, which is what macroblock
/// import relies on when it rebuilds the history from the store.
#[derive(Clone, Debug, Default)]
pub struct CompactMmr {
    /// `peaks[i]` is the pending subtree root covering `2^i` leaves.
    peaks: Vec<Option<Hash256>>,
    /// Total number of leaves appended.
    count: u64,
}

impl CompactMmr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Append one leaf, carrying completed subtrees upward.
    pub fn append(&mut self, leaf: Hash256) {
        self.count += 1;
        let mut node = leaf_hash(&leaf);
        let mut level = 0;
        loop {
            if level == self.peaks.len() {
                self.peaks.push(None);
            }
            match self.peaks[level].take() {
                None => {
                    self.peaks[level] = Some(node);
                    return;
                }
                Some(left) => {
                    node = node_hash(&left, &node);
                    level += 1;
                }
            }
        }
    }

    /// Bag the peaks into a single root, highest peak last.
    ///
    /// Returns [`Hash256::ZERO`] when empty.
    pub fn root(&self) -> Hash256 {
        let mut acc: Option<Hash256> = None;
        for peak in self.peaks.iter().flatten() {
            acc = Some(match acc {
                None => *peak,
                Some(lower) => node_hash(peak, &lower),
            });
        }
        acc.unwrap_or(Hash256::ZERO)
    }
}
