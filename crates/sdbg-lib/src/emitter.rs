//! SdBG emitter
//!
//! Consumes sorted level-2 batches in lexicographic order and writes
//! the succinct-graph record streams. Items sharing a (k-1)-mer form a
//! group; within a group, items sharing the `(a, b)` pair of successor
//! and BWT-predecessor characters form a sub-group that yields one
//! output record. Records where a solid counterpart makes a sentinel
//! edge redundant are suppressed.
//!
//! Classification runs in parallel over chunks snapped to group
//! boundaries; the actual stream writes happen in a single sequential
//! pass so the output order is deterministic.

use crate::constants::{MAX_DUMMY_EDGES, MAX_MULTI, SENTINEL};
use crate::cx1::substring::{SubstringBatch, SubstringLayout};
use crate::error::{Result, SdbgError};
use crate::writers::SdbgWriters;
use rayon::prelude::*;
use std::path::Path;
use tracing::info;

/// Where an output record's multiplicity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// The inverted multiplicity stored in the substring record
    /// (edge pipeline).
    StoredMultiplicity,
    /// The sub-group size `j - i` (read pipeline).
    GroupSize,
}

/// Counters reported after the final batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdbgStats {
    /// Emitted edge records.
    pub total_edges: i64,
    /// `$`-prefixed (dummy) nodes.
    pub num_dollar_nodes: u64,
    /// Records with LAST = 1.
    pub num_ones_in_last: i64,
    /// Records with W = 0 (edges into `$`).
    pub num_dummy_edges: i64,
    /// Histogram of W values.
    pub num_chars_in_w: [i64; 9],
}

/// Streaming emitter; feed sorted batches with [`absorb`](Self::absorb),
/// then call [`finish`](Self::finish).
pub struct SdbgEmitter {
    count_mode: CountMode,
    kmer_k: usize,
    writers: SdbgWriters,
    cur_suffix_first_char: i32,
    stats: SdbgStats,
}

impl SdbgEmitter {
    /// Open the output streams under `output_prefix`.
    pub fn new(
        output_prefix: &Path,
        layout: &SubstringLayout,
        count_mode: CountMode,
    ) -> Result<Self> {
        Ok(Self {
            count_mode,
            kmer_k: layout.kmer_k,
            writers: SdbgWriters::create(output_prefix, layout.words_per_dummy)?,
            cur_suffix_first_char: -1,
            stats: SdbgStats::default(),
        })
    }

    /// Absorb one sorted batch.
    pub fn absorb(&mut self, batch: &SubstringBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let count_mode = self.count_mode;
        let chunks = chunk_at_group_boundaries(batch, rayon::current_num_threads().max(1));
        let classified: Vec<Vec<u64>> = chunks
            .par_iter()
            .map(|range| classify_chunk(batch, range.clone(), count_mode))
            .collect();

        for records in &classified {
            for &record in records {
                self.write_record(batch, record)?;
            }
        }
        Ok(())
    }

    fn write_record(&mut self, batch: &SubstringBatch, record: u64) -> Result<()> {
        let rank = (record >> 32) as usize;
        let count = ((record >> 16) & 0xFFFF) as u32;
        let w = (record & 0xF) as u8;
        let last = (record >> 4) & 1 == 1;
        let is_dollar = (record >> 5) & 1 == 1;

        while batch.first_char(rank) as i32 > self.cur_suffix_first_char {
            self.cur_suffix_first_char += 1;
            self.writers.put_f_line(self.stats.total_edges)?;
        }

        self.writers.put_w(w)?;
        self.writers.put_last(last)?;
        self.writers.put_is_dollar(is_dollar)?;
        self.writers.put_multiplicity(count, self.stats.total_edges)?;

        self.stats.total_edges += 1;
        self.stats.num_chars_in_w[w as usize] += 1;
        self.stats.num_ones_in_last += last as i64;
        if w == 0 {
            self.stats.num_dummy_edges += 1;
        }
        if is_dollar {
            self.stats.num_dollar_nodes += 1;
            if self.stats.num_dollar_nodes >= MAX_DUMMY_EDGES {
                return Err(SdbgError::GraphTooDense(MAX_DUMMY_EDGES));
            }
            for word in batch.dummy_words(rank) {
                self.writers.put_dummy_word(word)?;
            }
        }
        Ok(())
    }

    /// Complete the `.f` tail, flush all streams, report counters.
    pub fn finish(self) -> Result<SdbgStats> {
        self.writers.finish(
            self.stats.total_edges,
            self.kmer_k,
            self.stats.num_dollar_nodes,
        )?;

        info!("number of $ A C G T A- C- G- T-:");
        info!("{:?}", self.stats.num_chars_in_w);
        info!("total number of edges: {}", self.stats.total_edges);
        info!("total number of ONEs: {}", self.stats.num_ones_in_last);
        info!("total number of v$ edges: {}", self.stats.num_dummy_edges);
        info!("total number of $v edges: {}", self.stats.num_dollar_nodes);
        Ok(self.stats)
    }

    /// Counters accumulated so far.
    #[cfg(test)]
    fn stats(&self) -> &SdbgStats {
        &self.stats
    }
}

/// Split `0..n` into chunks whose boundaries never cut a (k-1)-mer group.
fn chunk_at_group_boundaries(
    batch: &SubstringBatch,
    num_chunks: usize,
) -> Vec<std::ops::Range<usize>> {
    let n = batch.len();
    let per_chunk = n / num_chunks;
    let mut ranges = Vec::with_capacity(num_chunks);
    let mut last_end = 0usize;
    for c in 0..num_chunks {
        let start = last_end;
        let mut end = if c + 1 == num_chunks {
            n
        } else {
            (start + per_chunk).min(n)
        };
        if end > 0 {
            while end < n && !batch.is_diff_k_minus_one_mer(end - 1, end) {
                end += 1;
            }
        }
        ranges.push(start..end);
        last_end = end;
    }
    ranges
}

/// Classify every sub-group in `range` into a packed output record:
/// `(rank << 32) | (count << 16) | (is_dollar << 5) | (last << 4) | w`.
fn classify_chunk(
    batch: &SubstringBatch,
    range: std::ops::Range<usize>,
    count_mode: CountMode,
) -> Vec<u64> {
    let mut records = Vec::new();
    let mut group_start = range.start;
    while group_start < range.end {
        let mut group_end = group_start + 1;
        while group_end < range.end && !batch.is_diff_k_minus_one_mer(group_start, group_end) {
            group_end += 1;
        }

        // first pass: which a/b symbols have a solid partner, and which
        // record carries LAST for each a
        let mut has_solid_a = 0u8;
        let mut has_solid_b = 0u8;
        let mut last_a = [usize::MAX; 4];
        for i in group_start..group_end {
            let a = batch.extract_a(i);
            let b = batch.extract_b(i);
            if a != SENTINEL && b != SENTINEL {
                has_solid_a |= 1 << a;
                has_solid_b |= 1 << b;
            }
            if a != SENTINEL && (b != SENTINEL || has_solid_a & (1 << a) == 0) {
                last_a[a as usize] = i;
            }
        }

        // second pass: one record per (a, b) sub-group
        let mut outputed_b = 0u8;
        let mut i = group_start;
        while i < group_end {
            let a = batch.extract_a(i);
            let b = batch.extract_b(i);
            let mut j = i + 1;
            while j < group_end && batch.extract_a(j) == a && batch.extract_b(j) == b {
                j += 1;
            }

            let mut count = match count_mode {
                CountMode::StoredMultiplicity => MAX_MULTI - batch.extract_counting(i).min(MAX_MULTI),
                CountMode::GroupSize => ((j - i) as u32).min(MAX_MULTI),
            };
            let mut is_dollar = false;

            if a == SENTINEL {
                debug_assert!(b != SENTINEL);
                if has_solid_b & (1 << b) != 0 {
                    i = j;
                    continue;
                }
                is_dollar = true;
                count = 0;
            }
            if b == SENTINEL {
                debug_assert!(a != SENTINEL);
                if has_solid_a & (1 << a) != 0 {
                    i = j;
                    continue;
                }
                count = 0;
            }

            let w = if b == SENTINEL {
                0
            } else if outputed_b & (1 << b) != 0 {
                b + 5
            } else {
                b + 1
            };
            outputed_b |= 1 << b;
            let last = a != SENTINEL && last_a[a as usize] == j - 1;

            records.push(
                ((i as u64) << 32)
                    | ((count as u64) << 16)
                    | ((is_dollar as u64) << 5)
                    | ((last as u64) << 4)
                    | w as u64,
            );
            i = j;
        }
        group_start = group_end;
    }
    records
}
