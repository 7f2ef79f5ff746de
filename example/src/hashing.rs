//! The hot path: an iterated mixing function standing in for real work.

const ROUNDS: u32 = 4_000;

/// Digest one request. Deliberately CPU-bound; this line is where a causal
/// profile should place almost all of the potential speedup.
pub fn digest(request: u64) -> u64 {
    let mut acc = request ^ 0x9e37_79b9_7f4a_7c15;
    for round in 0..ROUNDS {
        acc = mix(acc, round as u64);
    }
    acc
}

#[inline]
fn mix(value: u64, salt: u64) -> u64 {
    let mut v = value.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    v ^= v >> 27;
    v = v.wrapping_add(salt.rotate_left(17));
    v ^ (v >> 31)
}
