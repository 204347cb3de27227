//! Block-range arithmetic and grouping of cache misses into upstream fetches.

use std::collections::BTreeSet;

/// Fixed block partitioning of an object's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockLayout {
    pub block_size: u64,
}

impl BlockLayout {
    #[inline]
    pub fn index_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    #[inline]
    pub fn start_of(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Inclusive block index range covering `[offset, end)`. `end > offset`.
    #[inline]
    pub fn covering(&self, offset: u64, end: u64) -> (u64, u64) {
        (self.index_of(offset), self.index_of(end - 1))
    }
}

/// One contiguous span of block indices to fetch in a single upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchPlan {
    pub first: u64,
    pub last: u64,
}

impl FetchPlan {
    pub fn offset(&self, layout: &BlockLayout) -> u64 {
        layout.start_of(self.first)
    }

    pub fn len(&self, layout: &BlockLayout) -> u64 {
        (self.last - self.first + 1) * layout.block_size
    }

    pub fn blocks(&self) -> impl Iterator<Item = u64> {
        self.first..=self.last
    }
}

/// Group missing block indices into fetch plans.
///
/// `required` is the union of block indices the current batch needs and
/// `missing` the subset absent from the cache. Blocks nobody asked for are
/// never spanned, so plans only form inside runs of consecutive required
/// indices. Within such a run:
///
/// - `split_ranges = false`: one plan stretches from the first missing index
///   to the last, spanning (and re-reading) any cached blocks in between;
/// - `split_ranges = true`: every maximal run of consecutive missing indices
///   becomes its own plan and cached blocks are never spanned.
pub(crate) fn plan_fetches(
    required: &BTreeSet<u64>,
    missing: &BTreeSet<u64>,
    split_ranges: bool,
) -> Vec<FetchPlan> {
    let mut plans = Vec::new();
    let mut run: Vec<u64> = Vec::new();
    let mut prev: Option<u64> = None;

    let mut flush = |run: &mut Vec<u64>| {
        if run.is_empty() {
            return;
        }
        if split_ranges {
            let mut first = run[0];
            let mut last = run[0];
            for &index in &run[1..] {
                if index == last + 1 {
                    last = index;
                } else {
                    plans.push(FetchPlan { first, last });
                    first = index;
                    last = index;
                }
            }
            plans.push(FetchPlan { first, last });
        } else {
            plans.push(FetchPlan {
                first: run[0],
                last: run[run.len() - 1],
            });
        }
        run.clear();
    };

    for &index in required {
        if prev.is_some_and(|p| index != p + 1) {
            flush(&mut run);
        }
        prev = Some(index);
        if missing.contains(&index) {
            run.push(index);
        }
    }
    flush(&mut run);
    plans
}
