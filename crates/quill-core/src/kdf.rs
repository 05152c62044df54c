//! Key derivation seam for block templating.
//!
//! Assembling a candidate block needs fresh coinbase and fee outputs plus a
//! coinbase kernel, all owned by the miner's wallet. Wallet key management
//! is out of scope for the chain core, so the processor only sees this
//! trait: something that can mint the mandatory block elements for a given
//! height and hand back the blinding scalar to fold into the body offset.

use crate::body::{Output, TxKernel};
use crate::types::{Commitment, Height, HeightRange, Scalar};

/// Derives the miner-owned elements of a candidate block.
pub trait KeyDerivation {
    /// Coinbase output for a block at `height`, with its blinding scalar.
    fn coinbase_output(&self, height: Height) -> (Output, Scalar);

    /// Coinbase kernel for a block at `height`, with its excess scalar.
    fn coinbase_kernel(&self, height: Height) -> (TxKernel, Scalar);

    /// Output collecting `fees` for a block at `height`.
    fn fees_output(&self, height: Height, fees: u64) -> (Output, Scalar);
}

/// Deterministic, seed-keyed derivation.
///
/// Commitments and scalars are BLAKE3 outputs of `(seed, tag, height,
/// value)`; distinct seeds yield disjoint element sets, which is all the
/// chain core can observe of a real wallet.
#[derive(Clone, Debug)]
pub struct DeterministicKdf {
    seed: [u8; 32],
}

impl DeterministicKdf {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Convenience constructor from a small test seed.
    pub fn from_byte(seed: u8) -> Self {
        Self::new([seed; 32])
    }

    fn derive(&self, tag: &[u8], height: Height, value: u64) -> (Commitment, Scalar) {
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(tag);
        hasher.update(&height.to_le_bytes());
        hasher.update(&value.to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let mut commitment = [0u8; 33];
        commitment[0] = 0x02 | (digest[0] & 1);
        commitment[1..].copy_from_slice(&digest);

        let scalar: [u8; 32] = blake3::hash(&digest).into();
        (Commitment(commitment), Scalar(scalar))
    }
}

impl KeyDerivation for DeterministicKdf {
    fn coinbase_output(&self, height: Height) -> (Output, Scalar) {
        let (commitment, sk) = self.derive(b"coinbase.out", height, 0);
        (
            Output {
                commitment,
                coinbase: true,
                maturity: 0,
            },
            sk,
        )
    }

    fn coinbase_kernel(&self, height: Height) -> (TxKernel, Scalar) {
        let (excess, sk) = self.derive(b"coinbase.krn", height, 0);
        (
            TxKernel {
                excess,
                fee: 0,
                height_range: HeightRange::new(height, u64::MAX),
            },
            sk,
        )
    }

    fn fees_output(&self, height: Height, fees: u64) -> (Output, Scalar) {
        let (commitment, sk) = self.derive(b"fees.out", height, fees);
        (
            Output {
                commitment,
                coinbase: false,
                maturity: 0,
            },
            sk,
        )
    }
}
