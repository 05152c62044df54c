//! The kernel accumulator: an authenticated presence-set of live kernels.
//!
//! Kernels are strictly unique over the live set; inserting an id twice is
//! a consensus failure surfaced through the `created` flag. The root is
//! cached lazily, same contract as the UTXO tree.
//!
//! One id is special: the all-zero hash is the subsidy sentinel. The
//! sentinel being *present* encodes "subsidy closed", which makes the
//! kernel root — and through it the definition hash — sensitive to the
//! subsidy state.

use std::collections::BTreeSet;

use quill_core::merkle;
use quill_core::types::Hash256;

/// Ordered set of live kernel ids with a lazily cached Merkle root.
#[derive(Clone, Debug, Default)]
pub struct KernelSet {
    kernels: BTreeSet<Hash256>,
    cached_root: Option<Hash256>,
}

impl KernelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.kernels.contains(id)
    }

    /// Insert an id. Returns whether it was newly created; `false` means
    /// the id was already live.
    pub fn insert(&mut self, id: Hash256) -> bool {
        self.cached_root = None;
        self.kernels.insert(id)
    }

    /// Remove an id. Returns whether it was present.
    pub fn remove(&mut self, id: &Hash256) -> bool {
        self.cached_root = None;
        self.kernels.remove(id)
    }

    /// Merkle root over the ids in ascending order. The empty set's root
    /// is [`Hash256::ZERO`].
    pub fn root(&mut self) -> Hash256 {
        if let Some(root) = self.cached_root {
            return root;
        }
        let ids: Vec<Hash256> = self.kernels.iter().copied().collect();
        let root = merkle::merkle_root(&ids);
        self.cached_root = Some(root);
        root
    }
}
