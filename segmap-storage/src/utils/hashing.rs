//! FNV-1a key hashing for segment selection and lookup slots

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash over the key bytes.
///
/// The low bits select the segment, the high 32 bits become the slot
/// fragment in the per-segment hash lookup, so the full 64-bit spread
/// matters more than raw speed here.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in key {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
