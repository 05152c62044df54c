//! Core protocol value types: hashes, commitments, difficulty, headers.
//!
//! The confidential-transaction cryptography is opaque at this layer:
//! commitments and scalars are carried as raw bytes and never interpreted,
//! only compared, ordered, and hashed.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::merkle;

/// Block height. Height [`GENESIS_HEIGHT`](crate::rules::GENESIS_HEIGHT) is
/// the first block; 0 means "no block" (the empty-chain cursor).
pub type Height = u64;

/// A 32-byte hash value.
///
/// Used for block header hashes (double SHA-256), kernel ids and merkle
/// roots (BLAKE3).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Reserved as the subsidy sentinel in
    /// the kernel set and as the previous-hash of the first block.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An opaque 33-byte Pedersen commitment.
///
/// Ordered lexicographically; the ordering is what makes UTXO keys
/// range-traversable.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Commitment(pub [u8; 33]);

impl Commitment {
    pub const ZERO: Self = Self([0u8; 33]);

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl Default for Commitment {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// An opaque group scalar, used for the aggregate blinding offset.
///
/// Treated as a 256-bit little-endian integer with wrapping addition, so
/// that `add` and `neg` are exact inverses of each other. That is the only
/// property the processor relies on: unapplying a block must restore the
/// offset bit-identically.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Scalar(pub [u8; 32]);

impl Scalar {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrapping 256-bit addition.
    pub fn add(&self, other: &Scalar) -> Scalar {
        let mut out = [0u8; 32];
        let mut carry = 0u16;
        for i in 0..32 {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Scalar(out)
    }

    /// Additive inverse (two's complement), so `a.add(&a.neg()) == ZERO`.
    pub fn neg(&self) -> Scalar {
        let mut out = [0u8; 32];
        let mut carry = 1u16;
        for i in 0..32 {
            let sum = (!self.0[i]) as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Scalar(out)
    }
}

/// Per-header proof-of-work difficulty.
///
/// Higher = more work. The PoW check interprets the first 8 bytes of the
/// header hash as a little-endian u64 and requires it to be at most
/// `u64::MAX / difficulty`, so difficulty 1 accepts any hash.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Difficulty(pub u64);

impl Difficulty {
    /// Hash-prefix bound for this difficulty.
    pub fn target(&self) -> u64 {
        u64::MAX / self.0.max(1)
    }

    /// Accumulate this difficulty on top of prior cumulative work.
    ///
    /// Saturates at `ChainWork::MAX`; with u64 per-header difficulty the
    /// 128-bit accumulator cannot realistically saturate.
    pub fn inc(&self, prior: ChainWork) -> ChainWork {
        ChainWork(prior.0.saturating_add(self.0 as u128))
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cumulative chain work: the integer sum of per-header difficulties from
/// genesis. Totally ordered; the reorg engine follows the maximum.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainWork(pub u128);

impl ChainWork {
    pub const ZERO: Self = Self(0);
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed height interval `[min, max]`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub fn new(min: Height, max: Height) -> Self {
        Self { min, max }
    }

    /// Single-height range `[h, h]`.
    pub fn single(h: Height) -> Self {
        Self { min: h, max: h }
    }

    pub fn contains(&self, h: Height) -> bool {
        self.min <= h && h <= self.max
    }

    /// Whether `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &HeightRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Number of heights in the range (0 for an inverted range).
    pub fn len(&self) -> u64 {
        if self.min > self.max {
            0
        } else {
            self.max - self.min + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Proof-of-work fields of a header.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Pow {
    /// Difficulty this header was mined at.
    pub difficulty: Difficulty,
    /// Nonce searched by the miner.
    pub nonce: u64,
}

/// The chain-position fields of a header: everything determined by the
/// predecessor. Used by macroblock header sequences, where only the first
/// header carries its prefix explicitly.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HeaderPrefix {
    pub height: Height,
    pub prev: Hash256,
    pub chainwork: ChainWork,
}

/// The per-header fields that are not derivable from the predecessor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HeaderElement {
    /// Commitment to the post-state: `H(H(utxo_root, kernel_root), history_root)`.
    pub definition: Hash256,
    /// Root of the live kernel set after this block.
    pub kernel_commitment: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Proof of work.
    pub pow: Pow,
}

/// A full block header.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Block height; the first block is at [`GENESIS_HEIGHT`](crate::rules::GENESIS_HEIGHT).
    pub height: Height,
    /// Hash of the previous header; `Hash256::ZERO` for the first block.
    pub prev: Hash256,
    /// Cumulative work including this header's own difficulty.
    pub chainwork: ChainWork,
    /// Commitment to the post-state of applying this block.
    pub definition: Hash256,
    /// Root of the live kernel set after this block.
    pub kernel_commitment: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Proof of work.
    pub pow: Pow,
}

/// Compact identity of a header: height plus hash.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HeaderId {
    pub height: Height,
    pub hash: Hash256,
}

impl fmt::Display for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:02x}{:02x}{:02x}{:02x}",
            self.height, self.hash.0[0], self.hash.0[1], self.hash.0[2], self.hash.0[3]
        )
    }
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 8 + 32 + 16 + 32 + 32 + 8 + 8 + 8;

    /// Compute the header hash (double SHA-256 over a fixed little-endian
    /// byte layout).
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.prev.as_bytes());
        data.extend_from_slice(&self.chainwork.0.to_le_bytes());
        data.extend_from_slice(self.definition.as_bytes());
        data.extend_from_slice(self.kernel_commitment.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.pow.difficulty.0.to_le_bytes());
        data.extend_from_slice(&self.pow.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Height plus hash.
    pub fn id(&self) -> HeaderId {
        HeaderId {
            height: self.height,
            hash: self.hash(),
        }
    }

    /// Standalone structural sanity, independent of any chain state.
    ///
    /// The first block must reference the zero hash; every header's
    /// cumulative work must cover at least its own difficulty.
    pub fn is_sane(&self) -> bool {
        if self.height < crate::rules::GENESIS_HEIGHT {
            return false;
        }
        if (self.height == crate::rules::GENESIS_HEIGHT) != self.prev.is_zero() {
            return false;
        }
        self.chainwork.0 >= self.pow.difficulty.0 as u128
    }

    /// Check the proof of work: the first 8 bytes of the header hash,
    /// little-endian, must not exceed the difficulty target.
    pub fn verify_pow(&self) -> bool {
        let hash = self.hash();
        let prefix = u64::from_le_bytes(hash.0[0..8].try_into().expect("hash is 32 bytes"));
        prefix <= self.pow.difficulty.target()
    }

    /// The prefix fields of this header.
    pub fn prefix(&self) -> HeaderPrefix {
        HeaderPrefix {
            height: self.height,
            prev: self.prev,
            chainwork: self.chainwork,
        }
    }

    /// The element fields of this header.
    pub fn element(&self) -> HeaderElement {
        HeaderElement {
            definition: self.definition,
            kernel_commitment: self.kernel_commitment,
            timestamp: self.timestamp,
            pow: self.pow,
        }
    }

    /// Reconstruct the successor header from its element fields.
    ///
    /// Height and prev follow from this header; chainwork accumulates the
    /// successor's own difficulty. Used when replaying a macroblock header
    /// sequence.
    pub fn next(&self, elem: &HeaderElement) -> BlockHeader {
        BlockHeader {
            height: self.height + 1,
            prev: self.hash(),
            chainwork: elem.pow.difficulty.inc(self.chainwork),
            definition: elem.definition,
            kernel_commitment: elem.kernel_commitment,
            timestamp: elem.timestamp,
            pow: elem.pow,
        }
    }
}

/// Compute the definition hash from the two live accumulator roots and the
/// history MMR root.
///
/// `H( H(utxo_root, kernel_root, combined=true), history_root, combined=false )`.
pub fn definition_hash(live: Hash256, history_root: Hash256) -> Hash256 {
    merkle::interpret(live, history_root, false)
}

/// Combine the UTXO root and kernel root into the live-state hash.
pub fn live_hash(utxo_root: Hash256, kernel_root: Hash256) -> Hash256 {
    merkle::interpret(utxo_root, kernel_root, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::GENESIS_HEIGHT;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            height: GENESIS_HEIGHT,
            prev: Hash256::ZERO,
            chainwork: ChainWork(1),
            definition: Hash256([0x11; 32]),
            kernel_commitment: Hash256([0x22; 32]),
            timestamp: 1_700_000_000,
            pow: Pow {
                difficulty: Difficulty(1),
                nonce: 0,
            },
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(Hash256::ZERO, Hash256::default());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    // --- Scalar ---

    #[test]
    fn scalar_add_neg_is_identity() {
        let a = Scalar([0x7F; 32]);
        assert_eq!(a.add(&a.neg()), Scalar::ZERO);
    }

    #[test]
    fn scalar_add_carries() {
        let a = Scalar([0xFF; 32]);
        let one = {
            let mut b = [0u8; 32];
            b[0] = 1;
            Scalar(b)
        };
        // 2^256 - 1 + 1 wraps to zero.
        assert_eq!(a.add(&one), Scalar::ZERO);
    }

    #[test]
    fn scalar_neg_zero_is_zero() {
        assert_eq!(Scalar::ZERO.neg(), Scalar::ZERO);
    }

    #[test]
    fn scalar_add_commutes() {
        let a = Scalar([3; 32]);
        let b = Scalar([0xC0; 32]);
        assert_eq!(a.add(&b), b.add(&a));
    }

    // --- Difficulty / ChainWork ---

    #[test]
    fn difficulty_one_accepts_everything() {
        assert_eq!(Difficulty(1).target(), u64::MAX);
    }

    #[test]
    fn difficulty_target_shrinks_with_work() {
        assert!(Difficulty(16).target() < Difficulty(2).target());
    }

    #[test]
    fn difficulty_zero_target_does_not_divide_by_zero() {
        assert_eq!(Difficulty(0).target(), u64::MAX);
    }

    #[test]
    fn chainwork_accumulates() {
        let w = Difficulty(5).inc(ChainWork(10));
        assert_eq!(w, ChainWork(15));
    }

    // --- HeightRange ---

    #[test]
    fn height_range_contains() {
        let hr = HeightRange::new(5, 10);
        assert!(hr.contains(5));
        assert!(hr.contains(10));
        assert!(!hr.contains(4));
        assert!(!hr.contains(11));
    }

    #[test]
    fn height_range_len() {
        assert_eq!(HeightRange::new(3, 7).len(), 5);
        assert_eq!(HeightRange::single(9).len(), 1);
        assert_eq!(HeightRange::new(7, 3).len(), 0);
    }

    #[test]
    fn height_range_contains_range() {
        let outer = HeightRange::new(1, 100);
        assert!(outer.contains_range(&HeightRange::new(1, 100)));
        assert!(outer.contains_range(&HeightRange::new(40, 60)));
        assert!(!outer.contains_range(&HeightRange::new(0, 60)));
        assert!(!outer.contains_range(&HeightRange::new(40, 101)));
    }

    // --- BlockHeader ---

    #[test]
    fn header_hash_deterministic() {
        let h = sample_header();
        assert_eq!(h.hash(), h.hash());
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1;
        h2.pow.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn header_sanity() {
        assert!(sample_header().is_sane());

        // First block must reference the zero hash.
        let mut h = sample_header();
        h.prev = Hash256([1; 32]);
        assert!(!h.is_sane());

        // Later blocks must not.
        let mut h = sample_header();
        h.height = GENESIS_HEIGHT + 1;
        assert!(!h.is_sane());
        h.prev = Hash256([1; 32]);
        assert!(h.is_sane());
    }

    #[test]
    fn header_sanity_rejects_zero_height() {
        let mut h = sample_header();
        h.height = 0;
        assert!(!h.is_sane());
    }

    #[test]
    fn header_sanity_requires_chainwork_cover_difficulty() {
        let mut h = sample_header();
        h.pow.difficulty = Difficulty(10);
        h.chainwork = ChainWork(3);
        assert!(!h.is_sane());
    }

    #[test]
    fn header_pow_easy_difficulty_passes() {
        assert!(sample_header().verify_pow());
    }

    #[test]
    fn header_pow_extreme_difficulty_fails() {
        let mut h = sample_header();
        h.pow.difficulty = Difficulty(u64::MAX);
        // Target 1: only a hash starting with 8+ zero bytes would pass.
        assert!(!h.verify_pow());
    }

    #[test]
    fn header_next_chains_prefix() {
        let h = sample_header();
        let elem = HeaderElement {
            definition: Hash256([0x33; 32]),
            kernel_commitment: Hash256([0x44; 32]),
            timestamp: h.timestamp + 60,
            pow: Pow {
                difficulty: Difficulty(2),
                nonce: 7,
            },
        };
        let next = h.next(&elem);
        assert_eq!(next.height, h.height + 1);
        assert_eq!(next.prev, h.hash());
        assert_eq!(next.chainwork, ChainWork(h.chainwork.0 + 2));
        assert_eq!(next.element(), elem);
    }

    #[test]
    fn header_prefix_element_roundtrip() {
        let h = sample_header();
        let p = h.prefix();
        let e = h.element();
        assert_eq!(p.height, h.height);
        assert_eq!(e.timestamp, h.timestamp);
    }

    #[test]
    fn header_id_display() {
        let id = sample_header().id();
        let s = format!("{id}");
        assert!(s.starts_with("1@"));
    }

    // --- Definition hash ---

    #[test]
    fn definition_binds_all_three_roots() {
        let u = Hash256([1; 32]);
        let k = Hash256([2; 32]);
        let hist = Hash256([3; 32]);
        let d = definition_hash(live_hash(u, k), hist);

        assert_ne!(d, definition_hash(live_hash(Hash256([9; 32]), k), hist));
        assert_ne!(d, definition_hash(live_hash(u, Hash256([9; 32])), hist));
        assert_ne!(d, definition_hash(live_hash(u, k), Hash256([9; 32])));
    }

    // --- Bincode round-trips ---

    #[test]
    fn bincode_round_trip_header() {
        let header = sample_header();
        let encoded = bincode::encode_to_vec(header, bincode::config::standard()).unwrap();
        let (decoded, _): (BlockHeader, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn bincode_round_trip_commitment() {
        let c = Commitment([0x5A; 33]);
        let encoded = bincode::encode_to_vec(c, bincode::config::standard()).unwrap();
        let (decoded, _): (Commitment, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(c, decoded);
    }
}
