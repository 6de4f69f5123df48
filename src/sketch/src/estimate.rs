//! Cardinality estimation over a sketch snapshot.
//!
//! The estimate is a pure function of the register vector: the raw
//! harmonic-mean estimate with the standard alpha bias correction, a
//! linear-counting substitution while the sketch is mostly empty, and the
//! published large-range correction for 32-bit hash spaces. Nothing here
//! mutates the sketch and nothing is randomized, so every replica that has
//! converged to the same registers reports the same number.

use crate::hll::HllSketch;

/// Raw estimates at or below `2.5 * m` fall back to linear counting while
/// zero registers remain.
const SMALL_RANGE_FACTOR: f64 = 2.5;

/// TWO_POW_32 is the boundary constant of the large-range correction. The
/// correction compensates hash collisions in a 32-bit hash space; with the
/// 64-bit hash used here the raw estimate stays far below the `2^32 / 30`
/// threshold for any realistic input, but the published formula is kept so
/// the estimator matches the algorithm it cites.
const TWO_POW_32: f64 = 4294967296.0;

/// alpha returns the bias-correction constant for m registers.
fn alpha(m: u32) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / (m as f64)),
    }
}

/// estimate returns the approximate number of distinct elements inserted
/// into the sketch (or into any sketch merged into it).
pub fn estimate(s: &HllSketch) -> f64 {
    let m = s.m() as f64;

    let mut sum = 0.0;
    for r in s.registers() {
        sum += 1.0 / ((1_u64 << r) as f64);
    }
    let mut e = alpha(s.m()) * m * m / sum;

    if e <= SMALL_RANGE_FACTOR * m {
        let v = s.zero_count();
        // With every register occupied linear counting is undefined and the
        // raw estimate stands.
        if v > 0 {
            e = m * (m / v as f64).ln();
        }
    } else if e > TWO_POW_32 / 30.0 {
        e = -TWO_POW_32 * (1.0 - e / TWO_POW_32).ln();
    }

    e
}
