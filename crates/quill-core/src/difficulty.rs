//! Difficulty adjustment.
//!
//! Difficulty is reviewed once every
//! [`DIFFICULTY_REVIEW_CYCLE`](crate::rules::DIFFICULTY_REVIEW_CYCLE) blocks
//! by comparing the elapsed wall-clock time of the cycle against the target
//! time. Per-review adjustments are clamped to [`MAX_ADJUSTMENT_FACTOR`]
//! (4×) to bound the effect of timestamp manipulation or sudden hashrate
//! swings.

use crate::rules::{BLOCK_TIME_SECS, DIFFICULTY_REVIEW_CYCLE};
use crate::types::Difficulty;

/// Maximum difficulty change factor per review.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Expected wall-clock seconds for one full review cycle.
pub const fn expected_cycle_time() -> u64 {
    DIFFICULTY_REVIEW_CYCLE * BLOCK_TIME_SECS
}

/// Compute the difficulty for the next review cycle.
///
/// `cycle_start_ts` and `cycle_end_ts` are the timestamps of the headers
/// bounding the cycle just completed. Blocks arriving faster than the
/// target raise the difficulty proportionally; slower blocks lower it.
/// The elapsed time is clamped to `[expected / 4, expected * 4]` and the
/// result never drops below difficulty 1.
pub fn adjust_difficulty(
    current: Difficulty,
    cycle_start_ts: u64,
    cycle_end_ts: u64,
) -> Difficulty {
    let expected = expected_cycle_time();
    let actual = cycle_end_ts.saturating_sub(cycle_start_ts).max(1);

    let min_time = expected / MAX_ADJUSTMENT_FACTOR;
    let max_time = expected.saturating_mul(MAX_ADJUSTMENT_FACTOR);
    let clamped = actual.clamp(min_time.max(1), max_time);

    // new = current * expected / actual. u128 intermediate: the product of
    // two u64 values always fits.
    let result = (current.0 as u128).saturating_mul(expected as u128) / (clamped as u128);

    Difficulty((result.min(u64::MAX as u128) as u64).max(1))
}
