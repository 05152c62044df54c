//! Consensus rules. All monetary values are in plumes (1 QUILL = 10^8 plumes).
//!
//! The full constant set is folded into [`config_checksum`]; the processor
//! persists the checksum on first start and refuses to open a store written
//! under a different configuration.

use crate::types::{Difficulty, Hash256, Height};

pub const COIN: u64 = 100_000_000;

/// Height of the first block. Height 0 is reserved for "no block yet".
pub const GENESIS_HEIGHT: Height = 1;

/// Coinbase emission per block.
pub const COINBASE_EMISSION: u64 = 80 * COIN;

/// Blocks a coinbase output must wait before it can be spent.
pub const MATURITY_COINBASE: Height = 60;

/// Blocks a regular output must wait before it can be spent.
pub const MATURITY_STD: Height = 0;

/// Maximum serialized block body size in bytes.
pub const MAX_BODY_SIZE: usize = 0x100000;

/// Number of recent headers over which the timestamp median is taken.
pub const MEDIAN_WINDOW: usize = 25;

/// Maximum seconds a header timestamp may run ahead of local time.
pub const TIMESTAMP_AHEAD_SECS: u64 = 2 * 60 * 60;

/// Deepest reorg the node will ever perform. States below
/// `cursor - MAX_ROLLBACK_HEIGHT` are final.
pub const MAX_ROLLBACK_HEIGHT: Height = 120;

/// Difficulty is reviewed once per this many blocks.
pub const DIFFICULTY_REVIEW_CYCLE: Height = 120;

/// Target seconds between blocks.
pub const BLOCK_TIME_SECS: u64 = 60;

/// Difficulty of the first block, before any review has data.
pub const START_DIFFICULTY: Difficulty = Difficulty(1);

/// Version tag mixed into the configuration checksum. Bump on any breaking
/// consensus change.
const CHECKSUM_TAG: &[u8] = b"quill.rules.v1";

/// Checksum over the compiled-in consensus configuration.
///
/// Persisted through the store's params table; a mismatch on startup means
/// the on-disk data was produced under different rules and must not be
/// reused.
pub fn config_checksum() -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHECKSUM_TAG);
    for v in [
        GENESIS_HEIGHT,
        COINBASE_EMISSION,
        MATURITY_COINBASE,
        MATURITY_STD,
        MAX_BODY_SIZE as u64,
        MEDIAN_WINDOW as u64,
        TIMESTAMP_AHEAD_SECS,
        MAX_ROLLBACK_HEIGHT,
        DIFFICULTY_REVIEW_CYCLE,
        BLOCK_TIME_SECS,
        START_DIFFICULTY.0,
    ] {
        hasher.update(&v.to_le_bytes());
    }
    Hash256(hasher.finalize().into())
}
