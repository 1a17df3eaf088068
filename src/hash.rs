//! Hash functions shared by the writer and any reader of a bundle.
//!
//! These are part of the bundle format: a viewer that rebuilds bucket
//! numbers or Bloom bit positions must compute exactly the same values, so
//! neither function may change without bumping the manifest format version.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over raw bytes.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// djb2 with xor mixing (`h = h * 33 ^ b`), wrapping at 32 bits.
pub fn djb2_xor32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33) ^ b as u32;
    }
    hash
}
