//! Transactions and block bodies.
//!
//! A body is the flat element soup of a Mimblewimble block: input and
//! output commitments, consumed and produced kernels, the aggregate
//! blinding offset, and the subsidy accounting. Bodies are exchanged as
//! opaque bincode blobs and decoded on interpretation.
//!
//! Element vectors are kept sorted; [`BlockBody::normalize`] restores the
//! sort order after merging and performs cut-through, cancelling an output
//! against an input of the same commitment. Cut-through only ever shrinks
//! a body.

use crate::error::BodyError;
use crate::rules;
use crate::types::{Commitment, Hash256, Height, HeightRange, Scalar};

/// Domain separation prefix for kernel ids.
const KERNEL_ID_PREFIX: &[u8] = b"quill.krn";

/// A spent UTXO reference.
///
/// `maturity` is 0 (unset) on the wire for live blocks; the interpreter
/// fills in the maturity it actually consumed, and macroblocks carry it
/// explicitly.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Input {
    pub commitment: Commitment,
    pub maturity: Height,
}

/// A newly created UTXO.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Output {
    pub commitment: Commitment,
    /// Coinbase outputs carry a longer maturity lock.
    pub coinbase: bool,
    /// Explicit maturity, only meaningful when at least
    /// [`GENESIS_HEIGHT`](crate::rules::GENESIS_HEIGHT); 0 means unset.
    /// Explicit maturities are accepted in macroblocks only.
    pub maturity: Height,
}

impl Output {
    /// The lowest maturity this output may be assigned when created in a
    /// block at height `h`.
    pub fn min_maturity(&self, h: Height) -> Height {
        h + if self.coinbase {
            rules::MATURITY_COINBASE
        } else {
            rules::MATURITY_STD
        }
    }
}

/// A transaction kernel: the signed excess of a balanced transaction.
///
/// Identified by a hash over its content; the all-zero id is reserved for
/// the subsidy sentinel and can never be produced by a real kernel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct TxKernel {
    pub excess: Commitment,
    pub fee: u64,
    /// Heights at which this kernel is valid.
    pub height_range: HeightRange,
}

impl TxKernel {
    /// Kernel id: BLAKE3 over the domain-prefixed content.
    pub fn id(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KERNEL_ID_PREFIX);
        hasher.update(self.excess.as_bytes());
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&self.height_range.min.to_le_bytes());
        hasher.update(&self.height_range.max.to_le_bytes());
        Hash256(hasher.finalize().into())
    }
}

/// A balanced transaction awaiting inclusion in a block.
#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernel_inputs: Vec<TxKernel>,
    pub kernel_outputs: Vec<TxKernel>,
    pub offset: Scalar,
}

impl Transaction {
    /// Total fee claimed by the transaction's kernels. `None` on overflow.
    pub fn fee(&self) -> Option<u64> {
        self.kernel_outputs
            .iter()
            .try_fold(0u64, |acc, k| acc.checked_add(k.fee))
    }

    /// Transaction id: BLAKE3 of the canonical encoding.
    pub fn id(&self) -> Result<Hash256, BodyError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BodyError::Encode(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> Result<usize, BodyError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BodyError::Encode(e.to_string()))?
            .len())
    }
}

/// A decoded block body.
#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct BlockBody {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernel_inputs: Vec<TxKernel>,
    pub kernel_outputs: Vec<TxKernel>,
    /// Aggregate blinding offset of all contained transactions.
    pub offset: Scalar,
    /// Coinbase subsidy claimed by this body. For a macroblock, the sum
    /// over the squashed range.
    pub subsidy: u64,
    /// Whether this body permanently closes the coinbase subsidy.
    pub subsidy_closing: bool,
}

impl BlockBody {
    /// Encode into the wire/store blob.
    pub fn encode(&self) -> Result<Vec<u8>, BodyError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BodyError::Encode(e.to_string()))
    }

    /// Decode a wire/store blob.
    pub fn decode(bytes: &[u8]) -> Result<BlockBody, BodyError> {
        let (body, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BodyError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(BodyError::Decode("trailing bytes".into()));
        }
        Ok(body)
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> Result<usize, BodyError> {
        Ok(self.encode()?.len())
    }

    /// Append a transaction's elements and fold in its offset.
    ///
    /// Leaves the vectors unsorted; callers run [`normalize`](Self::normalize)
    /// once assembly is done.
    pub fn merge_tx(&mut self, tx: &Transaction) {
        self.inputs.extend_from_slice(&tx.inputs);
        self.outputs.extend_from_slice(&tx.outputs);
        self.kernel_inputs.extend_from_slice(&tx.kernel_inputs);
        self.kernel_outputs.extend_from_slice(&tx.kernel_outputs);
        self.offset = self.offset.add(&tx.offset);
    }

    /// Sort all element vectors and apply cut-through: an input and an
    /// output with the same commitment cancel each other.
    ///
    /// Returns the number of cancelled pairs.
    pub fn normalize(&mut self) -> usize {
        self.inputs.sort_unstable();
        self.outputs.sort_unstable();
        self.kernel_inputs.sort_unstable();
        self.kernel_outputs.sort_unstable();

        let mut cut = 0;
        let mut kept_in = Vec::with_capacity(self.inputs.len());
        let mut kept_out = Vec::with_capacity(self.outputs.len());
        let mut i = 0;
        let mut o = 0;
        while i < self.inputs.len() && o < self.outputs.len() {
            match self.inputs[i].commitment.cmp(&self.outputs[o].commitment) {
                std::cmp::Ordering::Less => {
                    kept_in.push(self.inputs[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    kept_out.push(self.outputs[o]);
                    o += 1;
                }
                std::cmp::Ordering::Equal => {
                    cut += 1;
                    i += 1;
                    o += 1;
                }
            }
        }
        kept_in.extend_from_slice(&self.inputs[i..]);
        kept_out.extend_from_slice(&self.outputs[o..]);
        self.inputs = kept_in;
        self.outputs = kept_out;
        cut
    }

    /// Whether the body carries no elements at all.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.kernel_inputs.is_empty()
            && self.kernel_outputs.is_empty()
    }
}

/// Context-free verification of a body against the height range it claims
/// to cover.
///
/// The confidential-transaction proofs are a black box at this layer; what
/// is checked here is the structure consensus depends on: element order,
/// kernel validity windows, subsidy within emission for the range, and the
/// closing flag only while the subsidy is still open.
pub fn verify_body(body: &BlockBody, hr: &HeightRange, subsidy_open: bool) -> bool {
    if hr.is_empty() || hr.min < rules::GENESIS_HEIGHT {
        return false;
    }

    if !is_sorted(&body.inputs) || !is_sorted(&body.outputs) {
        return false;
    }
    if !is_sorted(&body.kernel_inputs) || !is_sorted(&body.kernel_outputs) {
        return false;
    }

    for krn in &body.kernel_outputs {
        // The kernel must be valid somewhere inside the covered range.
        if krn.height_range.max < hr.min || krn.height_range.min > hr.max {
            return false;
        }
        if krn.id().is_zero() {
            return false;
        }
    }

    let emission_cap = (rules::COINBASE_EMISSION as u128) * (hr.len() as u128);
    if (body.subsidy as u128) > emission_cap {
        return false;
    }

    if body.subsidy_closing && !subsidy_open {
        return false;
    }

    true
}

fn is_sorted<T: Ord>(v: &[T]) -> bool {
    v.windows(2).all(|w| w[0] <= w[1])
}
