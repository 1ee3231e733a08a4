//! # BadPageTable
//!
//! Per-block run-length encoding of pages flagged bad at manufacture
//! time. Runs are kept coalesced: no two runs within the same block are
//! adjacent or overlapping, so `get` is a single map lookup and `count`
//! is a linear scan over runs (not pages).

use std::collections::BTreeMap;

pub type BlockIdx = u32;
pub type PageIdx = u32;

/// Run-length map of defective pages, keyed by block.
#[derive(Debug, Default, Clone)]
pub struct BadPageTable {
    blocks: BTreeMap<BlockIdx, BTreeMap<PageIdx, u32>>,
}

impl BadPageTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records page `page` of block `block` as bad, coalescing with any
    /// adjacent run.
    ///
    /// Finds the run, if any, that ends exactly at `page` and extends it;
    /// otherwise starts a fresh one-page run. Either way, if a run starts
    /// exactly where the (possibly extended) run now ends, it is merged
    /// in and removed.
    pub fn insert(&mut self, block: BlockIdx, page: PageIdx) {
        let runs = self.blocks.entry(block).or_default();

        let predecessor = runs
            .range(..page)
            .next_back()
            .filter(|&(&start, &len)| start + len == page)
            .map(|(&start, _)| start);

        let (run_start, mut run_len) = if let Some(start) = predecessor {
            let len = *runs.get(&start).unwrap() + 1;
            runs.insert(start, len);
            (start, len)
        } else {
            runs.insert(page, 1);
            (page, 1)
        };

        let new_end = run_start + run_len;
        if let Some(&following_len) = runs.get(&new_end) {
            runs.remove(&new_end);
            run_len += following_len;
            runs.insert(run_start, run_len);
        }
    }

    /// Total number of bad pages in `block` (sum of run lengths).
    #[must_use]
    pub fn count(&self, block: BlockIdx) -> u32 {
        self.blocks
            .get(&block)
            .map(|runs| runs.values().sum())
            .unwrap_or(0)
    }

    /// Length of the run starting exactly at `page` in `block`, or 0 if
    /// `page` does not begin a run (including if it is a non-bad page,
    /// or the interior of a run that started earlier — callers that
    /// need "is this page bad at all" should scan from the nearest
    /// run start, which the FTL core does once at block construction).
    #[must_use]
    pub fn get(&self, block: BlockIdx, page: PageIdx) -> u32 {
        self.blocks
            .get(&block)
            .and_then(|runs| runs.get(&page))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct runs in `block`, for tests and diagnostics.
    #[must_use]
    pub fn run_count(&self, block: BlockIdx) -> usize {
        self.blocks.get(&block).map_or(0, BTreeMap::len)
    }
}
