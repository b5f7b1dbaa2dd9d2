//! Memory fitting and the level-1 / level-2 schedule
//!
//! Given per-bucket item counts and the host memory budget, decide how
//! many level-1 differential slots and level-2 substring slots to
//! allocate, then carve the bucket range into level-1 windows and,
//! inside each window, level-2 batches. Every batch fits the level-2
//! buffer; every window fits the level-1 buffer. If even the largest
//! single bucket cannot fit, construction fails up front with a
//! recommended budget.

use crate::config::MemPolicy;
use crate::constants::{DEFAULT_LV1_SCAN_TIME, LV1_BYTES_PER_ITEM, MAX_LV1_SCAN_TIME};
use crate::error::{Result, SdbgError};
use std::ops::Range;
use tracing::{debug, info};

/// Buffer capacities chosen by the memory fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFit {
    /// Level-1 buffer capacity in items (4 bytes each).
    pub max_lv1_items: i64,
    /// Level-2 buffer capacity in items.
    pub max_lv2_items: i64,
}

/// One level-2 batch: a contiguous bucket range and its item count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lv2Batch {
    /// Buckets covered by this batch.
    pub buckets: Range<usize>,
    /// Total items over those buckets.
    pub num_items: i64,
}

/// One level-1 window: a contiguous bucket range, its item count, and
/// the level-2 batches that drain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lv1Window {
    /// Buckets covered by this window.
    pub buckets: Range<usize>,
    /// Total items over those buckets.
    pub num_items: i64,
    /// Batches, in bucket order, jointly covering `buckets`.
    pub batches: Vec<Lv2Batch>,
}

/// Choose level-1/level-2 capacities for the given budget and policy.
///
/// `fixed_bytes` is memory already committed (packed sequences,
/// bookkeeping arrays); `tot_items` and `max_bucket_items` come from
/// the preprocessor scan.
pub fn fit_memory(
    budget: u64,
    fixed_bytes: u64,
    lv2_bytes_per_item: i64,
    tot_items: i64,
    max_bucket_items: i64,
    min_lv2_batch: i64,
    policy: MemPolicy,
) -> Result<MemoryFit> {
    let min_lv1_items = scan_floor(tot_items, MAX_LV1_SCAN_TIME);
    let min_lv2_items = max_bucket_items.max(min_lv2_batch);

    let insufficient = || SdbgError::BudgetInsufficient {
        budget,
        required: fixed_bytes
            + (min_lv2_items * lv2_bytes_per_item) as u64
            + (min_lv1_items.max(min_lv2_items) * LV1_BYTES_PER_ITEM) as u64,
    };

    if budget <= fixed_bytes {
        return Err(insufficient());
    }
    let mem_remained = (budget - fixed_bytes) as i64;

    let mut fit = MemoryFit {
        max_lv1_items: 0,
        max_lv2_items: min_lv2_items,
    };

    let adjust = |fit: &mut MemoryFit, mem_avail: i64| -> Result<()> {
        loop {
            if fit.max_lv2_items < min_lv2_items {
                return Err(insufficient());
            }
            let mem_lv2 = fit.max_lv2_items * lv2_bytes_per_item;
            if mem_avail > mem_lv2 {
                fit.max_lv1_items = (mem_avail - mem_lv2) / LV1_BYTES_PER_ITEM;
                if fit.max_lv1_items >= min_lv1_items && fit.max_lv1_items >= fit.max_lv2_items {
                    break;
                }
            }
            fit.max_lv2_items = fit.max_lv2_items * 95 / 100;
        }
        // trade level-2 slack for more level-1 slots
        while fit.max_lv2_items * 4 > fit.max_lv1_items
            && fit.max_lv2_items * 95 / 100 >= min_lv2_items
        {
            fit.max_lv2_items = fit.max_lv2_items * 95 / 100;
            fit.max_lv1_items = (mem_avail - fit.max_lv2_items * lv2_bytes_per_item) / LV1_BYTES_PER_ITEM;
        }
        Ok(())
    };

    match policy {
        MemPolicy::Auto => {
            fit.max_lv1_items = fit
                .max_lv2_items
                .max(scan_floor(tot_items, DEFAULT_LV1_SCAN_TIME));
            let mem_needed =
                fit.max_lv1_items * LV1_BYTES_PER_ITEM + fit.max_lv2_items * lv2_bytes_per_item;
            if mem_needed > mem_remained {
                adjust(&mut fit, mem_remained)?;
            }
        }
        MemPolicy::Minimum => {
            fit.max_lv1_items = fit
                .max_lv2_items
                .max(scan_floor(tot_items, MAX_LV1_SCAN_TIME));
            let mem_needed =
                fit.max_lv1_items * LV1_BYTES_PER_ITEM + fit.max_lv2_items * lv2_bytes_per_item;
            adjust(&mut fit, mem_needed.min(mem_remained))?;
        }
        MemPolicy::Maximum => {
            adjust(&mut fit, mem_remained)?;
        }
    }

    info!(
        "memory fit: max lv.1 items = {}, max lv.2 items = {}",
        fit.max_lv1_items, fit.max_lv2_items
    );
    Ok(fit)
}

/// Items per scan so that all items drain within `scan_time` passes.
fn scan_floor(tot_items: i64, scan_time: i64) -> i64 {
    // the original divides by (scan_time - 0.5); keep that bias
    (tot_items * 2 / (2 * scan_time - 1)).max(1)
}

/// Carve buckets into level-1 windows of level-2 batches, greedily.
pub fn plan_schedule(
    bucket_sizes: &[i64],
    max_lv1_items: i64,
    max_lv2_items: i64,
) -> Result<Vec<Lv1Window>> {
    let num_buckets = bucket_sizes.len();
    let mut windows = Vec::new();
    let mut b = 0;

    while b < num_buckets {
        let window_start = b;
        let mut window_items = 0i64;
        let mut batches = Vec::new();
        let mut batch_start = b;
        let mut batch_items = 0i64;

        while b < num_buckets {
            let size = bucket_sizes[b];
            if size > max_lv2_items {
                return Err(SdbgError::InternalInvariant(format!(
                    "bucket {b} holds {size} items, above the level-2 capacity {max_lv2_items}"
                )));
            }
            if window_items + size > max_lv1_items {
                break;
            }
            if batch_items + size > max_lv2_items {
                if batch_items > 0 {
                    batches.push(Lv2Batch {
                        buckets: batch_start..b,
                        num_items: batch_items,
                    });
                }
                batch_start = b;
                batch_items = 0;
            }
            batch_items += size;
            window_items += size;
            b += 1;
        }

        if b == window_start {
            // max_lv1_items >= max_lv2_items >= every bucket, so the
            // window always advances; anything else is a planner bug
            return Err(SdbgError::InternalInvariant(format!(
                "level-1 window cannot accommodate bucket {b}"
            )));
        }
        if batch_items > 0 {
            batches.push(Lv2Batch {
                buckets: batch_start..b,
                num_items: batch_items,
            });
        }
        if window_items > 0 {
            windows.push(Lv1Window {
                buckets: window_start..b,
                num_items: window_items,
                batches,
            });
        }
    }

    debug!(
        "planned {} level-1 window(s), {} level-2 batch(es)",
        windows.len(),
        windows.iter().map(|w| w.batches.len()).sum::<usize>()
    );
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_single_window() {
        let sizes = vec![3, 0, 5, 2];
        let windows = plan_schedule(&sizes, 100, 100).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].buckets, 0..4);
        assert_eq!(windows[0].num_items, 10);
        assert_eq!(windows[0].batches.len(), 1);
        assert_eq!(windows[0].batches[0].num_items, 10);
    }

    #[test]
    fn test_schedule_batch_per_bucket_under_squeeze() {
        // level-2 capacity equal to the largest bucket forces one batch
        // per non-empty bucket
        let sizes = vec![5, 4, 5, 3];
        let windows = plan_schedule(&sizes, 100, 5).unwrap();
        let batches: Vec<_> = windows.iter().flat_map(|w| w.batches.clone()).collect();
        assert_eq!(batches.len(), 4);
        for batch in &batches {
            assert!(batch.num_items <= 5);
        }
    }

    #[test]
    fn test_schedule_windows_respect_lv1_cap() {
        let sizes = vec![4, 4, 4, 4];
        let windows = plan_schedule(&sizes, 8, 8).unwrap();
        assert_eq!(windows.len(), 2);
        for w in &windows {
            assert!(w.num_items <= 8);
            let sum: i64 = w.batches.iter().map(|b| b.num_items).sum();
            assert_eq!(sum, w.num_items);
        }
        // windows are contiguous and cover all buckets
        assert_eq!(windows[0].buckets.end, windows[1].buckets.start);
        assert_eq!(windows[1].buckets.end, 4);
    }

    #[test]
    fn test_schedule_rejects_oversized_bucket() {
        let sizes = vec![1, 9];
        assert!(plan_schedule(&sizes, 100, 8).is_err());
    }

    #[test]
    fn test_fit_memory_rejects_tiny_budget() {
        let err = fit_memory(1 << 10, 512, 24, 1000, 100, 100, MemPolicy::Auto).unwrap_err();
        match err {
            SdbgError::BudgetInsufficient { budget, required } => {
                assert_eq!(budget, 1 << 10);
                assert!(required > budget);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fit_memory_honours_floors() {
        let fit = fit_memory(64 << 20, 1 << 20, 24, 100_000, 4_000, 1_000, MemPolicy::Auto)
            .unwrap();
        assert!(fit.max_lv2_items >= 4_000);
        assert!(fit.max_lv1_items >= fit.max_lv2_items);
    }

    #[test]
    fn test_fit_memory_min_policy_spends_less() {
        let budget = 256u64 << 20;
        let auto = fit_memory(budget, 0, 24, 10_000_000, 1_000, 1_000, MemPolicy::Auto).unwrap();
        let min = fit_memory(budget, 0, 24, 10_000_000, 1_000, 1_000, MemPolicy::Minimum).unwrap();
        let max = fit_memory(budget, 0, 24, 10_000_000, 1_000, 1_000, MemPolicy::Maximum).unwrap();
        assert!(min.max_lv1_items <= auto.max_lv1_items);
        assert!(auto.max_lv1_items <= max.max_lv1_items);
    }
}
