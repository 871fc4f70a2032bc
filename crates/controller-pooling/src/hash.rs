//! Routing-key hashing.
//!
//! Every host must map a request id to the same bucket, so the hash is fixed
//! to the Kafka flavour of murmur2 rather than anything seeded per process.

const SEED: u32 = 0x9747b28c;
const M: u32 = 0x5bd1e995;
const R: u32 = 24;

/// 32-bit murmur2 (Kafka variant, seed `0x9747b28c`).
pub fn murmur2(data: &[u8]) -> u32 {
    let len = data.len();
    let mut h = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Bucket index for a routing key: sign bit masked, then modulo `bucket_count`.
///
/// `bucket_count` must be non-zero; configuration validation guarantees it.
#[inline]
pub fn bucket_of(key: &str, bucket_count: usize) -> usize {
    ((murmur2(key.as_bytes()) & 0x7fff_ffff) as usize) % bucket_count
}
