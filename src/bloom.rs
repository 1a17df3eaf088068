//! Per-shard Bloom filters for approximate text and sender search.
//!
//! Bit positions use double hashing: `(h1 + i * h2) mod bits` for
//! `i in 0..hashes`, with `h1 = fnv1a32(token)` and `h2 = djb2_xor32(token) | 1`.
//! The digest is the raw bit array (bit `p` in byte `p / 8`, mask
//! `1 << (p % 8)`) encoded as standard padded base64.
//!
//! The writer side only exposes [`BloomFilter::add`] and
//! [`BloomFilter::digest`]. [`BloomProbe`] is the read side used by bundle
//! inspection and tests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::hash::{djb2_xor32, fnv1a32};

/// Identifier written to the manifest so readers know which hashing scheme
/// produced the digests.
pub const HASH_SCHEME: &str = "fnv1a32+djb2/double";

/// N-gram lengths inserted for text search.
pub const NGRAM_SIZES: [usize; 2] = [2, 3];

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_len: u64,
    hashes: u32,
}

impl BloomFilter {
    /// `bits` is rounded by [`filter_bits`]; `hashes` is clamped to at
    /// least 1.
    pub fn new(bits: usize, hashes: u32) -> Self {
        let bit_len = filter_bits(bits);
        Self {
            bits: vec![0u8; bit_len / 8],
            bit_len: bit_len as u64,
            hashes: hashes.max(1),
        }
    }

    pub fn add(&mut self, token: &str) {
        for pos in positions(token.as_bytes(), self.bit_len, self.hashes) {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    pub fn digest(&self) -> String {
        STANDARD.encode(&self.bits)
    }

    pub fn bit_len(&self) -> u64 {
        self.bit_len
    }

    /// Number of set bits; used for fill-ratio logging.
    pub fn ones(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }
}

/// Bit count a filter configured with `bits` actually hashes over: at least
/// 8, rounded up to whole bytes. Readers take the modulus from the manifest,
/// so this is the value recorded there.
pub fn filter_bits(bits: usize) -> usize {
    bits.max(8).div_ceil(8) * 8
}

fn positions(token: &[u8], bit_len: u64, hashes: u32) -> impl Iterator<Item = u64> {
    let h1 = fnv1a32(token) as u64;
    let h2 = (djb2_xor32(token) | 1) as u64;
    (0..hashes as u64).map(move |i| (h1 + i * h2) % bit_len)
}

/// Read-only view over a serialized digest.
#[derive(Debug, Clone)]
pub struct BloomProbe {
    bits: Vec<u8>,
    hashes: u32,
}

impl BloomProbe {
    pub fn from_digest(digest: &str, hashes: u32) -> Result<Self, base64::DecodeError> {
        let bits = STANDARD.decode(digest)?;
        Ok(Self {
            bits,
            hashes: hashes.max(1),
        })
    }

    /// `false` means definitely absent; `true` means possibly present.
    pub fn might_contain(&self, token: &str) -> bool {
        let bit_len = (self.bits.len() * 8) as u64;
        if bit_len == 0 {
            return false;
        }
        positions(token.as_bytes(), bit_len, self.hashes)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    /// True when every 2/3-gram of `query` might be present. Queries shorter
    /// than two characters cannot be pre-filtered and always match.
    pub fn might_contain_text(&self, query: &str) -> bool {
        let lowered = query.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        if chars.len() < 2 {
            return true;
        }
        let mut all = true;
        for_each_ngram(&chars, |gram| all &= self.might_contain(gram));
        all
    }
}

/// Result of indexing one record's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextIndexOutcome {
    pub ngrams: usize,
    pub truncated: bool,
}

/// Insert every 2- and 3-gram of the lower-cased text, limited to the first
/// `max_chars` characters.
pub fn index_text(filter: &mut BloomFilter, text: &str, max_chars: usize) -> TextIndexOutcome {
    let lowered = text.to_lowercase();
    let mut chars: Vec<char> = lowered.chars().take(max_chars.saturating_add(1)).collect();
    let truncated = chars.len() > max_chars;
    chars.truncate(max_chars);

    let mut ngrams = 0;
    for_each_ngram(&chars, |gram| {
        filter.add(gram);
        ngrams += 1;
    });
    TextIndexOutcome { ngrams, truncated }
}

fn for_each_ngram(chars: &[char], mut f: impl FnMut(&str)) {
    let mut gram = String::with_capacity(12);
    for n in NGRAM_SIZES {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            gram.clear();
            gram.extend(window.iter());
            f(&gram);
        }
    }
}
