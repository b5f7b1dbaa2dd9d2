//! Lock-free bit vector for the solid-(k+1)-mer bitmap.

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-size bit vector with atomic set, shared read-only between
/// the mercy-marking and bucket-scan phases.
pub struct AtomicBitVector {
    words: Vec<AtomicU64>,
    len: usize,
}

impl AtomicBitVector {
    /// Create a vector of `len` zero bits.
    pub fn new(len: usize) -> Self {
        let num_words = len.div_ceil(64);
        let mut words = Vec::with_capacity(num_words);
        words.resize_with(num_words, || AtomicU64::new(0));
        Self { words, len }
    }

    /// Rebuild from raw little-endian words (e.g. a bitmap file).
    pub fn from_raw(raw: Vec<u64>, len: usize) -> Self {
        assert!(raw.len() * 64 >= len, "raw bitmap shorter than {len} bits");
        Self {
            words: raw.into_iter().map(AtomicU64::new).collect(),
            len,
        }
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector holds zero bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        (self.words[idx / 64].load(Ordering::Relaxed) >> (idx % 64)) & 1 == 1
    }

    /// Set bit `idx`.
    #[inline]
    pub fn set(&self, idx: usize) {
        debug_assert!(idx < self.len);
        self.words[idx / 64].fetch_or(1 << (idx % 64), Ordering::Relaxed);
    }

    /// Count of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let bv = AtomicBitVector::new(130);
        assert!(!bv.get(0));
        bv.set(0);
        bv.set(63);
        bv.set(64);
        bv.set(129);
        assert!(bv.get(0));
        assert!(bv.get(63));
        assert!(bv.get(64));
        assert!(bv.get(129));
        assert!(!bv.get(1));
        assert_eq!(bv.count_ones(), 4);
    }

    #[test]
    fn test_from_raw() {
        let bv = AtomicBitVector::from_raw(vec![0b101], 3);
        assert!(bv.get(0));
        assert!(!bv.get(1));
        assert!(bv.get(2));
    }
}
