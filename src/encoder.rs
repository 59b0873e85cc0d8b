//! Iteration-count encoder.
//!
//! Materializes a repetition count into the loop-bound register with the
//! shortest AArch64 `movz`/`movk` sequence. The sequence runs once, before the
//! loop, so its cost lands in the fixed overhead and never in the slope.
//!
//! Two tiers are covered:
//!
//! ```text
//!   count <= 0xFFFF        movz x11, #count
//!   count <= 0xFFFF_FFFF   movz x11, #low16
//!                          movk x11, #high16, lsl #16
//! ```

use crate::error::{CalibrationError, Result};

/// Register holding the loop bound; the loop compares its counter against it.
pub const BOUND_REGISTER: &str = "x11";

/// Largest value a single 16-bit immediate can carry.
pub const SINGLE_IMMEDIATE_MAX: u64 = 0xFFFF;

/// Largest repetition count the two-instruction sequence can carry.
pub const MAX_REPETITIONS: u64 = 0xFFFF_FFFF;

/// Emit the instruction sequence loading `count` into [`BOUND_REGISTER`].
///
/// Returns one instruction when the count fits a 16-bit immediate and two
/// otherwise. Counts above [`MAX_REPETITIONS`] are rejected.
pub fn encode_iteration_count(count: u64) -> Result<Vec<String>> {
    if count > MAX_REPETITIONS {
        return Err(CalibrationError::RepetitionCountTooLarge {
            count,
            max: MAX_REPETITIONS,
        });
    }

    if count <= SINGLE_IMMEDIATE_MAX {
        return Ok(vec![format!("movz {BOUND_REGISTER}, #{count}")]);
    }

    let low = count & 0xFFFF;
    let high = (count >> 16) & 0xFFFF;
    Ok(vec![
        format!("movz {BOUND_REGISTER}, #{low}"),
        format!("movk {BOUND_REGISTER}, #{high}, lsl #16"),
    ])
}
