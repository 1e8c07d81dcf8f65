//! Bloom filter matching the exact bit-layout and hashing scheme required
//! for on-disk compatibility: CRC32 hashing, a rotated delta for double
//! hashing, and the probe count stored as the trailing byte of the filter.

/// Default bits-per-key used when building a filter (~1% false positive rate).
pub const DEFAULT_BITS_PER_KEY: usize = 10;

fn num_probes(bits_per_key: usize) -> u8 {
    // k = round(bits_per_key * ln2), clamped to [1, 30].
    let k = (bits_per_key as f64 * std::f64::consts::LN_2).round() as i64;
    k.clamp(1, 30) as u8
}

/// Builds a Bloom filter over `keys`. The returned bytes are the bit array
/// followed by a single trailing byte holding the probe count `k`.
pub fn build(keys: &[&[u8]], bits_per_key: usize) -> Vec<u8> {
    let k = num_probes(bits_per_key);
    let mut bits = keys.len() * bits_per_key;
    if bits < 64 {
        bits = 64;
    }
    let bytes = bits.div_ceil(8);
    let mut filter = vec![0u8; bytes + 1];
    let len = filter.len();

    for key in keys {
        let mut h = crc32fast::hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = (h as usize) % (8 * (len - 1));
            filter[bit_pos / 8] |= 1 << (bit_pos % 8);
            h = h.wrapping_add(delta);
        }
    }
    filter[bytes] = k;
    filter
}

/// Tests whether `key` may be present in the table that produced `filter`.
/// Never returns `false` for a key that was actually included when the
/// filter was built (no false negatives); may return `true` for absent
/// keys (false positives), bounded by the configured bits-per-key.
pub fn may_contain(filter: &[u8], key: &[u8]) -> bool {
    if filter.len() < 2 {
        return false;
    }
    let len = filter.len();
    let k = filter[len - 1];
    if k > 30 {
        // Conservative: an unrecognized encoding must not produce false
        // negatives.
        return true;
    }
    let array_len = len - 1;
    let mut h = crc32fast::hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bit_pos = (h as usize) % (8 * array_len);
        if filter[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}
