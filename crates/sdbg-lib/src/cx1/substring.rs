//! Column-major level-2 substring records
//!
//! Each sortable item is `words_per_item` 32-bit words. The k bases of
//! the substring are packed MSB-first from the top of word 0; the low
//! bits of the last word carry, from bit 0 upward: an optional 16-bit
//! inverted multiplicity, the 3-bit BWT predecessor character, and the
//! has-full-kmer flag. The two pipelines place the flag at different
//! bit positions (with or without the multiplicity field below it);
//! that asymmetry is confined to [`SubstringLayout`].
//!
//! Items are stored column-major: word `w` of item `i` lives at
//! `w * n + i`, so the sort primitive can stride one word at a time
//! over all items.

use crate::constants::{
    BASES_PER_WORD, BWT_CHAR_BITS, MAX_MULTI, MULTI_BITS, SENTINEL,
};

/// Maximum words per level-2 item (`ceil((2*MAX_K + 20) / 32)`).
pub const MAX_SUBSTRING_WORDS: usize = 9;

/// Bit positions of the per-item tag fields in the last word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubstringLayout {
    /// k of the substring's k-mer.
    pub kmer_k: usize,
    /// 16 for the edge pipeline, 0 for the read pipeline.
    pub multi_bits: u32,
    /// Words per item.
    pub words_per_item: usize,
    /// Words of a dummy-node record (`ceil(2k / 32)`).
    pub words_per_dummy: usize,
}

impl SubstringLayout {
    /// Layout of the edge pipeline (with an inverted multiplicity field).
    pub fn with_multiplicity(kmer_k: usize) -> Self {
        Self::new(kmer_k, MULTI_BITS)
    }

    /// Layout of the read pipeline (no multiplicity field).
    pub fn without_multiplicity(kmer_k: usize) -> Self {
        Self::new(kmer_k, 0)
    }

    fn new(kmer_k: usize, multi_bits: u32) -> Self {
        let tag_bits = 1 + BWT_CHAR_BITS + multi_bits;
        Self {
            kmer_k,
            multi_bits,
            words_per_item: (2 * kmer_k + tag_bits as usize).div_ceil(32),
            words_per_dummy: (2 * kmer_k).div_ceil(32),
        }
    }

    /// Bit of the has-full-kmer flag within the last word.
    #[inline]
    pub fn flag_shift(&self) -> u32 {
        BWT_CHAR_BITS + self.multi_bits
    }

    /// Build the low-bit tag of the last word.
    #[inline]
    pub fn tag(&self, full_kmer: bool, prev_char: u8, counting: u32) -> u32 {
        let mut tag = ((full_kmer as u32) << self.flag_shift())
            | ((prev_char as u32) << self.multi_bits);
        if self.multi_bits > 0 {
            tag |= MAX_MULTI - counting.min(MAX_MULTI);
        }
        tag
    }
}

/// Read a 32-bit window starting at an arbitrary base offset of a
/// packed buffer; bases past the end read as zero.
#[inline]
fn read_word(src: &[u32], base_offset: usize) -> u32 {
    let wi = base_offset / BASES_PER_WORD;
    let shift = 2 * (base_offset % BASES_PER_WORD);
    let hi = src.get(wi).copied().unwrap_or(0);
    if shift == 0 {
        hi
    } else {
        (hi << shift) | (src.get(wi + 1).copied().unwrap_or(0) >> (32 - shift))
    }
}

#[inline]
fn read_base(src: &[u32], idx: usize) -> u8 {
    ((src[idx / BASES_PER_WORD] >> (30 - 2 * (idx % BASES_PER_WORD))) & 3) as u8
}

/// Copy `num_chars` bases starting at `base_offset` into `out`,
/// left-aligned MSB-first; the rest of `out` is zeroed.
pub fn pack_forward(src: &[u32], base_offset: usize, num_chars: usize, out: &mut [u32]) {
    for (j, w) in out.iter_mut().enumerate() {
        let taken = num_chars.saturating_sub(j * BASES_PER_WORD).min(BASES_PER_WORD);
        *w = if taken == 0 {
            0
        } else {
            let word = read_word(src, base_offset + j * BASES_PER_WORD);
            if taken == BASES_PER_WORD {
                word
            } else {
                word & (!0u32 << (32 - 2 * taken))
            }
        };
    }
}

/// Like [`pack_forward`] but writes the reverse complement of the
/// `num_chars` bases starting at `base_offset`.
pub fn pack_reverse_complement(
    src: &[u32],
    base_offset: usize,
    num_chars: usize,
    out: &mut [u32],
) {
    for (j, w) in out.iter_mut().enumerate() {
        let taken = num_chars.saturating_sub(j * BASES_PER_WORD).min(BASES_PER_WORD);
        let mut word = 0u32;
        for c in 0..taken {
            let src_idx = base_offset + num_chars - 1 - (j * BASES_PER_WORD + c);
            word |= ((3 - read_base(src, src_idx)) as u32) << (30 - 2 * c);
        }
        *w = word;
    }
}

/// A sorted level-2 batch: the column-major word block, its permutation,
/// and the layout. Items are addressed by sorted rank.
pub struct SubstringBatch<'a> {
    words: &'a [u32],
    perm: &'a [u32],
    n: usize,
    layout: SubstringLayout,
}

impl<'a> SubstringBatch<'a> {
    /// View `n` items of `words` through `perm`.
    pub fn new(words: &'a [u32], perm: &'a [u32], n: usize, layout: SubstringLayout) -> Self {
        debug_assert!(words.len() >= n * layout.words_per_item);
        debug_assert!(perm.len() >= n);
        Self { words, perm, n, layout }
    }

    /// Number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether the batch holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// The layout in effect.
    #[inline]
    pub fn layout(&self) -> &SubstringLayout {
        &self.layout
    }

    #[inline]
    fn word(&self, rank: usize, w: usize) -> u32 {
        self.words[w * self.n + self.perm[rank] as usize]
    }

    #[inline]
    fn last_word(&self, rank: usize) -> u32 {
        self.word(rank, self.layout.words_per_item - 1)
    }

    /// The successor character `a`: base k-1 of the substring, or the
    /// sentinel when the item holds only k-1 bases.
    pub fn extract_a(&self, rank: usize) -> u8 {
        let non_dollar = (self.last_word(rank) >> self.layout.flag_shift()) & 1;
        if non_dollar == 1 {
            let i = self.layout.kmer_k - 1;
            ((self.word(rank, i / BASES_PER_WORD) >> (30 - 2 * (i % BASES_PER_WORD))) & 3) as u8
        } else {
            SENTINEL
        }
    }

    /// The BWT predecessor character `b` (may be the sentinel).
    #[inline]
    pub fn extract_b(&self, rank: usize) -> u8 {
        ((self.last_word(rank) >> self.layout.multi_bits) & ((1 << BWT_CHAR_BITS) - 1)) as u8
    }

    /// The stored inverted multiplicity (zero without a multiplicity field).
    #[inline]
    pub fn extract_counting(&self, rank: usize) -> u32 {
        if self.layout.multi_bits == 0 {
            0
        } else {
            self.last_word(rank) & ((1 << self.layout.multi_bits) - 1)
        }
    }

    /// First base of the k-mer (the leading character class).
    #[inline]
    pub fn first_char(&self, rank: usize) -> u8 {
        (self.word(rank, 0) >> 30) as u8
    }

    /// Whether two items differ in their leading (k-1)-mer.
    pub fn is_diff_k_minus_one_mer(&self, r1: usize, r2: usize) -> bool {
        let full_words = (self.layout.kmer_k - 1) / BASES_PER_WORD;
        let rem = (self.layout.kmer_k - 1) % BASES_PER_WORD;
        if rem > 0 {
            let shift = 2 * (BASES_PER_WORD - rem);
            if (self.word(r1, full_words) >> shift) != (self.word(r2, full_words) >> shift) {
                return true;
            }
        }
        for w in (0..full_words).rev() {
            if self.word(r1, w) != self.word(r2, w) {
                return true;
            }
        }
        false
    }

    /// The k-mer content of an item, row-major (for dummy-node records).
    pub fn dummy_words(&self, rank: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.layout.words_per_dummy).map(move |w| self.word(rank, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_base;
    use crate::sequence_package::SequencePackage;

    fn pack(s: &str) -> SequencePackage {
        let mut p = SequencePackage::new();
        let bases: Vec<u8> = s.bytes().map(|b| encode_base(b).unwrap()).collect();
        p.append_bases(&bases);
        p
    }

    fn unpack(words: &[u32], n: usize) -> String {
        (0..n)
            .map(|i| {
                let c = (words[i / 16] >> (30 - 2 * (i % 16))) & 3;
                b"ACGT"[c as usize] as char
            })
            .collect()
    }

    #[test]
    fn test_layout_widths() {
        let edge = SubstringLayout::with_multiplicity(27);
        assert_eq!(edge.words_per_item, 3); // 54 + 20 bits
        assert_eq!(edge.words_per_dummy, 2);
        assert_eq!(edge.flag_shift(), 19);

        let read = SubstringLayout::without_multiplicity(27);
        assert_eq!(read.words_per_item, 2); // 54 + 4 bits
        assert_eq!(read.flag_shift(), 3);

        let tiny = SubstringLayout::with_multiplicity(3);
        assert_eq!(tiny.words_per_item, 1); // 6 + 20 bits
    }

    #[test]
    fn test_pack_forward() {
        let p = pack("ACGTACGTACGTACGTACGT");
        let mut out = [0u32; 2];
        pack_forward(p.words(), 2, 6, &mut out);
        assert_eq!(unpack(&out, 6), "GTACGT");
        // everything past the copied bases is zero
        assert_eq!(out[0] & ((1 << 20) - 1), 0);
        assert_eq!(out[1], 0);

        // a copy crossing the word boundary
        pack_forward(p.words(), 10, 10, &mut out);
        assert_eq!(unpack(&out, 10), "GTACGTACGT");
    }

    #[test]
    fn test_pack_reverse_complement() {
        let p = pack("AACGT");
        let mut out = [0u32; 1];
        pack_reverse_complement(p.words(), 0, 5, &mut out);
        // revcomp(AACGT) = ACGTT
        assert_eq!(unpack(&out, 5), "ACGTT");
    }

    #[test]
    fn test_tag_and_extract() {
        let layout = SubstringLayout::with_multiplicity(5);
        let p = pack("ACGTT");
        let n = 1usize;
        let mut words = vec![0u32; layout.words_per_item * n];
        pack_forward(p.words(), 0, 5, &mut words[..1]);
        words[layout.words_per_item - 1] |= layout.tag(true, 2, 7);

        let perm = [0u32];
        let batch = SubstringBatch::new(&words, &perm, n, layout);
        assert_eq!(batch.extract_a(0), 3); // base 4 of ACGTT
        assert_eq!(batch.extract_b(0), 2);
        assert_eq!(batch.extract_counting(0), MAX_MULTI - 7);
        assert_eq!(batch.first_char(0), 0); // A
    }

    #[test]
    fn test_sentinel_a_when_flag_clear() {
        let layout = SubstringLayout::with_multiplicity(5);
        let p = pack("ACGT");
        let mut words = vec![0u32; layout.words_per_item];
        pack_forward(p.words(), 0, 4, &mut words[..1]);
        words[layout.words_per_item - 1] |= layout.tag(false, SENTINEL, 0);

        let perm = [0u32];
        let batch = SubstringBatch::new(&words, &perm, 1, layout);
        assert_eq!(batch.extract_a(0), SENTINEL);
        assert_eq!(batch.extract_b(0), SENTINEL);
    }

    #[test]
    fn test_diff_k_minus_one_mer() {
        let layout = SubstringLayout::with_multiplicity(4);
        // two items sharing the leading 3-mer ACG, one not
        let seqs = ["ACGA", "ACGT", "ACTA"];
        let n = seqs.len();
        let mut words = vec![0u32; layout.words_per_item * n];
        for (i, s) in seqs.iter().enumerate() {
            let p = pack(s);
            let mut item = [0u32; 1];
            pack_forward(p.words(), 0, 4, &mut item);
            words[i] = item[0]; // word 0 column
        }
        let perm = [0u32, 1, 2];
        let batch = SubstringBatch::new(&words, &perm, n, layout);
        assert!(!batch.is_diff_k_minus_one_mer(0, 1));
        assert!(batch.is_diff_k_minus_one_mer(1, 2));
    }
}
