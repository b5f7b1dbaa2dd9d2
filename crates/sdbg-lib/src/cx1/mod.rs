//! The two-level external-memory bucket sort (CX1)
//!
//! The driver runs the shared skeleton of both construction pipelines:
//!
//! 1. scan all sequences and count edge occurrences per bucket;
//! 2. fit the level-1 / level-2 buffers into the memory budget and plan
//!    the window/batch schedule;
//! 3. per level-1 window, re-derive occurrences and store compressed
//!    differential offsets; per level-2 batch, decode the offsets,
//!    materialise sortable substrings, sort, and hand the sorted batch
//!    to the emitter.
//!
//! Phases are fork-join: work is statically partitioned by sequence
//! range (scan, fill) or bucket range (extract), with a barrier between
//! phases. The emit of one batch overlaps the extract+sort of the next
//! through a double-buffered `(substrings, permutation)` pair.

pub mod planner;
pub mod sort;
pub mod substring;

use crate::config::BuildConfig;
use crate::constants::DIFFERENTIAL_LIMIT;
use crate::emitter::SdbgEmitter;
use crate::error::{Result, SdbgError};
use planner::Lv2Batch;
use rayon::prelude::*;
use sort::SortBackend;
use std::ops::Range;
use std::sync::Mutex;
use substring::{SubstringBatch, SubstringLayout, MAX_SUBSTRING_WORDS};
use tracing::{debug, info};

/// A write-only view of a shared buffer. Phases that partition work so
/// that every index is written by exactly one worker use this to write
/// through a shared reference.
struct SharedSlice<T> {
    ptr: *mut T,
    len: usize,
}

unsafe impl<T: Send> Send for SharedSlice<T> {}
unsafe impl<T: Send> Sync for SharedSlice<T> {}

impl<T: Copy> SharedSlice<T> {
    fn new(slice: &mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Safety: no two workers may write the same index, and `idx` must
    /// be in bounds (checked).
    #[inline]
    unsafe fn write(&self, idx: usize, value: T) {
        assert!(idx < self.len);
        unsafe { self.ptr.add(idx).write(value) };
    }
}

/// Per-worker sink for level-1 differential offsets.
///
/// Each worker owns its own bucket cursors and previous-offset array,
/// so differentials are per-worker/per-bucket; the decode side replays
/// them with the same partitioning.
pub struct Lv1Sink<'a> {
    window: Range<usize>,
    lv1: &'a SharedSlice<i32>,
    cursors: Vec<i64>,
    prev_full_offsets: Vec<i64>,
    side: &'a Mutex<Vec<i64>>,
}

impl Lv1Sink<'_> {
    /// Record one edge occurrence, if its bucket lies in the current
    /// level-1 window.
    #[inline]
    pub fn push(&mut self, bucket: usize, full_offset: i64) -> Result<()> {
        if !self.window.contains(&bucket) {
            return Ok(());
        }
        let slot = self.cursors[bucket] as usize;
        self.cursors[bucket] += 1;
        let differential = full_offset - self.prev_full_offsets[bucket];
        if differential > DIFFERENTIAL_LIMIT {
            let mut side = self.side.lock().expect("level-1 side table poisoned");
            let index = side.len();
            side.push(full_offset);
            unsafe { self.lv1.write(slot, -(index as i32) - 1) };
        } else {
            if differential < 0 {
                return Err(SdbgError::InternalInvariant(format!(
                    "negative level-1 differential {differential} in bucket {bucket}"
                )));
            }
            unsafe { self.lv1.write(slot, differential as i32) };
        }
        self.prev_full_offsets[bucket] = full_offset;
        Ok(())
    }
}

/// The pipeline-specific half of CX1: how sequences map to edge
/// occurrences, how occurrences encode into absolute offsets, and how
/// an offset materialises into a sortable substring.
pub trait Cx1Pipeline: Sync {
    /// Number of stored sequences.
    fn num_sequences(&self) -> usize;

    /// Number of buckets.
    fn num_buckets(&self) -> usize;

    /// Level-2 record layout.
    fn substring_layout(&self) -> SubstringLayout;

    /// Smallest absolute offset a worker starting at `seq_id` can emit;
    /// seeds the per-bucket differential bases.
    fn lv1_diff_base(&self, seq_id: usize) -> i64;

    /// Count edge occurrences per bucket over a sequence range
    /// (both strands).
    fn scan_bucket_sizes(&self, seqs: Range<usize>, bucket_sizes: &mut [i64]);

    /// Re-derive the same occurrences and push them into the sink.
    fn fill_offsets(&self, seqs: Range<usize>, sink: &mut Lv1Sink<'_>) -> Result<()>;

    /// Materialise the level-2 record for one absolute offset into
    /// `out` (`words_per_item` words, row-major).
    fn extract_substring(&self, full_offset: i64, out: &mut [u32]);
}

/// Run the full CX1 loop, feeding sorted batches to `emitter`.
/// The caller finishes the emitter afterwards.
pub fn run<P: Cx1Pipeline>(
    pipeline: &P,
    config: &BuildConfig,
    fixed_mem_bytes: u64,
    sort_backend: &dyn SortBackend,
    emitter: &mut SdbgEmitter,
) -> Result<()> {
    let num_seqs = pipeline.num_sequences();
    let num_buckets = pipeline.num_buckets();
    let layout = pipeline.substring_layout();
    let num_threads = rayon::current_num_threads().max(1);

    // --- phase: bucket-size preprocessing -------------------------------
    let rp_ranges = partition_sequences(num_seqs, num_threads);
    let rp_bucket_sizes: Vec<Vec<i64>> = rp_ranges
        .par_iter()
        .map(|range| {
            let mut sizes = vec![0i64; num_buckets];
            pipeline.scan_bucket_sizes(range.clone(), &mut sizes);
            sizes
        })
        .collect();

    let mut bucket_sizes = vec![0i64; num_buckets];
    for per_worker in &rp_bucket_sizes {
        for (total, &s) in bucket_sizes.iter_mut().zip(per_worker.iter()) {
            *total += s;
        }
    }
    let tot_items: i64 = bucket_sizes.iter().sum();
    let max_bucket_items = bucket_sizes.iter().copied().max().unwrap_or(0);
    info!(
        "{} words per substring, {} sequences, {} edge occurrences, largest bucket {}",
        layout.words_per_item, num_seqs, tot_items, max_bucket_items
    );

    // --- phase: memory fit and schedule ---------------------------------
    // substring + permutation, double buffered, plus the emitter's
    // per-item mark and the sort scratch pair
    let lv2_bytes_per_item = ((layout.words_per_item * 4 + 4) * 2 + 1 + 16) as i64;
    let bookkeeping = (num_buckets * 8 * (3 * num_threads + 1)) as u64;
    let fit = planner::fit_memory(
        config.host_mem,
        fixed_mem_bytes + bookkeeping,
        lv2_bytes_per_item,
        tot_items,
        max_bucket_items,
        config.min_lv2_batch_items,
        config.mem_policy,
    )?;
    let schedule = planner::plan_schedule(&bucket_sizes, fit.max_lv1_items, fit.max_lv2_items)?;

    // --- allocations -----------------------------------------------------
    let mut lv1_items = vec![0i32; fit.max_lv1_items as usize];
    let words_cap = fit.max_lv2_items as usize * layout.words_per_item;
    let mut front_substr = vec![0u32; words_cap];
    let mut back_substr = vec![0u32; words_cap];
    let mut front_perm: Vec<u32> = Vec::with_capacity(fit.max_lv2_items as usize);
    let mut back_perm: Vec<u32> = Vec::with_capacity(fit.max_lv2_items as usize);

    let diff_bases: Vec<i64> = rp_ranges
        .iter()
        .map(|r| pipeline.lv1_diff_base(r.start))
        .collect();

    // --- the level-1 / level-2 loop --------------------------------------
    for (window_idx, window) in schedule.iter().enumerate() {
        debug!(
            "lv.1 window {}/{}: buckets {:?}, {} items",
            window_idx + 1,
            schedule.len(),
            window.buckets,
            window.num_items
        );

        // per-worker slot offsets: bucket-major, worker-minor
        let mut offsets: Vec<Vec<i64>> = vec![vec![0i64; num_buckets]; num_threads];
        let mut acc = 0i64;
        for b in window.buckets.clone() {
            for (t, worker_sizes) in rp_bucket_sizes.iter().enumerate() {
                offsets[t][b] = acc;
                acc += worker_sizes[b];
            }
        }
        debug_assert_eq!(acc, window.num_items);

        // fill differential offsets
        let side = Mutex::new(Vec::new());
        {
            let lv1_shared = SharedSlice::new(&mut lv1_items[..window.num_items as usize]);
            rp_ranges
                .par_iter()
                .enumerate()
                .try_for_each(|(t, range)| -> Result<()> {
                    if range.is_empty() {
                        return Ok(());
                    }
                    let mut sink = Lv1Sink {
                        window: window.buckets.clone(),
                        lv1: &lv1_shared,
                        cursors: offsets[t].clone(),
                        prev_full_offsets: vec![diff_bases[t]; num_buckets],
                        side: &side,
                    };
                    pipeline.fill_offsets(range.clone(), &mut sink)
                })?;
        }
        let side_items = side.into_inner().expect("level-1 side table poisoned");
        if !side_items.is_empty() {
            debug!("{} offsets spilled to the side table", side_items.len());
        }

        let lv1_filled = &lv1_items[..window.num_items as usize];
        let mut prepared = false;
        for (batch_idx, batch) in window.batches.iter().enumerate() {
            if !prepared {
                prepare_batch(
                    pipeline,
                    batch,
                    &layout,
                    lv1_filled,
                    &side_items,
                    &offsets,
                    &rp_bucket_sizes,
                    &diff_bases,
                    sort_backend,
                    &mut front_substr,
                    &mut front_perm,
                )?;
            }
            std::mem::swap(&mut front_substr, &mut back_substr);
            std::mem::swap(&mut front_perm, &mut back_perm);

            let n = batch.num_items as usize;
            let next = window.batches.get(batch_idx + 1);
            let batch_view = SubstringBatch::new(
                &back_substr[..n * layout.words_per_item],
                &back_perm[..n],
                n,
                layout,
            );
            // emit this batch while the next one extracts and sorts
            let (emit_result, prepare_result) = rayon::join(
                || emitter.absorb(&batch_view),
                || match next {
                    Some(next_batch) => prepare_batch(
                        pipeline,
                        next_batch,
                        &layout,
                        lv1_filled,
                        &side_items,
                        &offsets,
                        &rp_bucket_sizes,
                        &diff_bases,
                        sort_backend,
                        &mut front_substr,
                        &mut front_perm,
                    )
                    .map(|_| true),
                    None => Ok(false),
                },
            );
            emit_result?;
            prepared = prepare_result?;
        }
    }

    Ok(())
}

/// Decode one batch's level-1 slots into absolute offsets and
/// materialise the column-major substring block, then sort it.
#[allow(clippy::too_many_arguments)]
fn prepare_batch<P: Cx1Pipeline>(
    pipeline: &P,
    batch: &Lv2Batch,
    layout: &SubstringLayout,
    lv1_items: &[i32],
    side_items: &[i64],
    offsets: &[Vec<i64>],
    rp_bucket_sizes: &[Vec<i64>],
    diff_bases: &[i64],
    sort_backend: &dyn SortBackend,
    substr: &mut Vec<u32>,
    perm: &mut Vec<u32>,
) -> Result<()> {
    let n = batch.num_items as usize;
    let wpi = layout.words_per_item;
    let out = &mut substr[..n * wpi];
    let shared = SharedSlice::new(out);
    let batch_slot_base = offsets[0][batch.buckets.start];

    batch
        .buckets
        .clone()
        .into_par_iter()
        .try_for_each(|bucket| -> Result<()> {
            let mut item_cursor = (offsets[0][bucket] - batch_slot_base) as usize;
            let mut item_words = [0u32; MAX_SUBSTRING_WORDS];
            for (t, worker_sizes) in rp_bucket_sizes.iter().enumerate() {
                let mut full_offset = diff_bases[t];
                let first_slot = offsets[t][bucket] as usize;
                let count = worker_sizes[bucket] as usize;
                for slot in first_slot..first_slot + count {
                    let v = lv1_items[slot];
                    if v >= 0 {
                        full_offset += v as i64;
                    } else {
                        full_offset = side_items[(-1 - v) as usize];
                    }
                    pipeline.extract_substring(full_offset, &mut item_words[..wpi]);
                    for (w, &word) in item_words[..wpi].iter().enumerate() {
                        unsafe { shared.write(w * n + item_cursor, word) };
                    }
                    item_cursor += 1;
                }
            }
            Ok(())
        })?;

    sort_backend.sort(&substr[..n * wpi], wpi, n, perm);
    Ok(())
}

/// Split `0..num_seqs` into `num_threads` contiguous ranges.
fn partition_sequences(num_seqs: usize, num_threads: usize) -> Vec<Range<usize>> {
    let chunk = num_seqs.div_ceil(num_threads.max(1)).max(1);
    (0..num_threads)
        .map(|t| {
            let start = (t * chunk).min(num_seqs);
            let end = ((t + 1) * chunk).min(num_seqs);
            start..end
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_sequences_covers_all() {
        for (n, t) in [(0usize, 4usize), (1, 4), (7, 3), (12, 4), (5, 8)] {
            let ranges = partition_sequences(n, t);
            assert_eq!(ranges.len(), t);
            let mut expect = 0;
            for r in &ranges {
                assert_eq!(r.start, expect.min(n));
                expect = r.end;
            }
            assert_eq!(ranges.last().map(|r| r.end), Some(n));
        }
    }

    #[test]
    fn test_shared_slice_disjoint_writes() {
        let mut data = vec![0u32; 64];
        let shared = SharedSlice::new(&mut data);
        (0..64usize).into_par_iter().for_each(|i| unsafe {
            shared.write(i, i as u32 * 2);
        });
        assert!(data.iter().enumerate().all(|(i, &v)| v == i as u32 * 2));
    }

    /// Replaying non-negative differentials plus side-table
    /// substitutions reproduces the original offsets, including spills
    /// past the differential limit.
    #[test]
    fn test_lv1_differential_roundtrip() {
        let diff_base = 10i64;
        let offsets_in: Vec<i64> = vec![
            12,
            12 + DIFFERENTIAL_LIMIT, // differential exactly at the limit
            13 + 2 * DIFFERENTIAL_LIMIT, // above the limit: spills
            14 + 2 * DIFFERENTIAL_LIMIT,
        ];

        let mut lv1 = vec![0i32; offsets_in.len()];
        let side = Mutex::new(Vec::new());
        {
            let shared = SharedSlice::new(&mut lv1[..]);
            let mut sink = Lv1Sink {
                window: 0..1,
                lv1: &shared,
                cursors: vec![0],
                prev_full_offsets: vec![diff_base],
                side: &side,
            };
            for &offset in &offsets_in {
                sink.push(0, offset).unwrap();
            }
        }
        let side_items = side.into_inner().unwrap();
        assert_eq!(side_items.len(), 1);

        let mut replayed = Vec::new();
        let mut full = diff_base;
        for &v in &lv1 {
            if v >= 0 {
                full += v as i64;
            } else {
                full = side_items[(-1 - v) as usize];
            }
            replayed.push(full);
        }
        assert_eq!(replayed, offsets_in);
    }

    /// Out-of-window buckets are ignored and a backward offset is a
    /// reported invariant violation.
    #[test]
    fn test_lv1_sink_window_and_negative_diff() {
        let mut lv1 = vec![0i32; 4];
        let side = Mutex::new(Vec::new());
        let shared = SharedSlice::new(&mut lv1[..]);
        let mut sink = Lv1Sink {
            window: 1..2,
            lv1: &shared,
            cursors: vec![0, 0],
            prev_full_offsets: vec![0, 0],
            side: &side,
        };
        sink.push(0, 100).unwrap(); // outside the window: dropped
        sink.push(1, 5).unwrap();
        assert!(sink.push(1, 3).is_err()); // offsets must not go backward
    }
}
