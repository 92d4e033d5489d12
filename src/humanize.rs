// src/humanize.rs
//
// Deterministic humanization: a pure hash of `(SOURCE_ID, PRNG_SEED)`
// produces a bounded timing offset and velocity delta so that
// `advance(A), reset(), advance(A)` emits an identical event stream for
// identical registers.
//
// This is not a PRNG stream — there is no advancing state — it is a hash
// function sampled once per node per quantum, the same shape as the
// synapse table's Knuth multiplicative hash (layout::KNUTH_HASH_CONST),
// just with a different mixing constant so the two don't correlate.

use crate::layout::FIXED_POINT_SCALE;

const HUMANIZE_HASH_CONST: u32 = 0x85EB_CA6B;

/// Mix `source_id` and `seed` into a single well-distributed u32.
fn mix(source_id: u32, seed: u32) -> u32 {
    let mut h = source_id ^ seed.wrapping_mul(HUMANIZE_HASH_CONST);
    h ^= h >> 15;
    h = h.wrapping_mul(HUMANIZE_HASH_CONST);
    h ^= h >> 13;
    h
}

/// Map a u32 hash to a signed fraction in `[-1.0, 1.0]`, as a ppt-scaled
/// i32 (so `scale_ppt(h, 1000)` returns a value in `[-1000, 1000]`).
fn signed_ppt(hash: u32, scale: i32) -> i32 {
    // Use the low 16 bits for a centered, evenly distributed sample.
    let sample = (hash & 0xFFFF) as i64 - 0x8000;
    ((sample * scale as i64) / 0x8000) as i32
}

/// Timing offset in ticks, bounded by `HUMAN_TIMING_PPT` parts-per-thousand
/// of one PPQ.
pub fn humanize_timing(source_id: u32, seed: u32, timing_ppt: i32, ppq: u32) -> i32 {
    if timing_ppt == 0 {
        return 0;
    }
    let hash = mix(source_id, seed);
    let ppt = signed_ppt(hash, timing_ppt);
    (ppt as i64 * ppq as i64 / FIXED_POINT_SCALE) as i32
}

/// Velocity delta bounded by `HUMAN_VEL_PPT` parts-per-thousand of 127.
/// Uses a distinct salt from the timing hash so the two transforms
/// don't move in lockstep.
pub fn humanize_velocity(source_id: u32, seed: u32, vel_ppt: i32) -> i32 {
    if vel_ppt == 0 {
        return 0;
    }
    let hash = mix(source_id.wrapping_add(1), seed);
    let ppt = signed_ppt(hash, vel_ppt);
    (ppt as i64 * 127 / FIXED_POINT_SCALE) as i32
}
