//! # Work Partitioning
//!
//! Splits `n` ordered work items into `k` contiguous ranges: every worker
//! gets `floor(n / k)` items and the last worker absorbs the remainder.
//! The union of the ranges covers `[0, n)` exactly once.

use std::ops::Range;

/// Computes the contiguous range for worker `index` of `worker_count`.
///
/// # Panics
///
/// Debug-asserts that `index < worker_count` and `worker_count > 0`.
#[inline]
#[must_use]
pub fn worker_range(total: usize, worker_count: usize, index: usize) -> Range<usize> {
    debug_assert!(worker_count > 0);
    debug_assert!(index < worker_count);

    let share = total / worker_count;
    let start = share * index;
    let end = if index == worker_count - 1 {
        total
    } else {
        start + share
    };
    start..end
}

/// Computes all `worker_count` ranges over `[0, total)`.
#[must_use]
pub fn split_ranges(total: usize, worker_count: usize) -> Vec<Range<usize>> {
    (0..worker_count)
        .map(|index| worker_range(total, worker_count, index))
        .collect()
}
