//! # Block
//!
//! State of one physical flash block: per-sub-unit validity/erase
//! bitmaps, write cursors, LPN backreferences (for GC copy-forward),
//! and a permanent unavailable-page mask derived from the shared
//! `BadPageTable` at construction time.
//!
//! `Block` never retains a reference back to the salvation config or
//! the bad-page table past the call that needs them — both are passed
//! in by the caller for the duration of `construct` only.

use ftl_badpage::BadPageTable;
use ftl_bitset::Bitset;
use ftl_errormodel::ErrorModel;
use ftl_salvation::SalvationConfig;
use rand::Rng;

pub type BlockIdx = u32;
pub type PageIdx = u32;
pub type Lpn = u64;
pub type Tick = u64;

/// Errors from misuse of a single block's read/write/invalidate
/// contract. All are invariant-fatal per the simulator's error
/// taxonomy: callers (the page-mapping layer) are expected to never
/// trigger them in a correctly driven simulation, so the FTL core
/// treats them as `expect`-worthy rather than recoverable.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("page {page} sub-unit {subunit} is not erased")]
    NotErased { page: PageIdx, subunit: usize },
    #[error("write to page {page} sub-unit {subunit} is out of order; expected page {expected}")]
    OutOfOrderWrite { page: PageIdx, subunit: usize, expected: PageIdx },
    #[error("page {page} sub-unit {subunit} is not valid")]
    NotValid { page: PageIdx, subunit: usize },
    #[error("sub-unit {subunit} out of range (io_unit_in_page = {io_unit_in_page})")]
    SubUnitOutOfRange { subunit: usize, io_unit_in_page: usize },
}

/// Per-page validity snapshot returned by [`Block::page_info`].
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// True iff at least one sub-unit at the page is valid.
    pub any_valid: bool,
    /// Per-sub-unit validity.
    pub valid_mask: Vec<bool>,
    /// Per-sub-unit stored LPN, if any.
    pub lpns: Vec<Option<Lpn>>,
}

/// State of one physical flash block.
pub struct Block {
    idx: BlockIdx,
    pages_in_block: u32,
    io_unit_in_page: usize,
    erase_count: u32,
    last_accessed: Tick,
    next_write_page_index: Vec<PageIdx>,
    valid: Vec<Bitset>,
    erased: Vec<Bitset>,
    dirty: Vec<Bitset>,
    lpns: Vec<Vec<Option<Lpn>>>,
    unavailable: Bitset,
}

fn first_available(unavailable: &Bitset, mut p: u32, pages_in_block: u32) -> u32 {
    while p < pages_in_block && unavailable.test(p as usize) {
        p += 1;
    }
    p
}

fn fresh_erased(unavailable: &Bitset, pages_in_block: u32) -> Bitset {
    let mut b = Bitset::new(pages_in_block as usize);
    for p in 0..pages_in_block {
        if !unavailable.test(p as usize) {
            b.set(p as usize);
        }
    }
    b
}

impl Block {
    /// Constructs a block, drawing per-page unavailability from `model`
    /// when `salvation.enabled`, and recording any newly-discovered bad
    /// page in `bad_page_table`.
    #[must_use]
    pub fn construct(
        idx: BlockIdx,
        pages_in_block: u32,
        io_unit_in_page: usize,
        salvation: SalvationConfig,
        model: &mut dyn ErrorModel,
        salvation_rng: &mut impl Rng,
        bad_page_table: &mut BadPageTable,
    ) -> Self {
        let mut unavailable = Bitset::new(pages_in_block as usize);
        if salvation.enabled {
            for page in 0..pages_in_block {
                let per = model.per().clamp(0.0, 1.0);
                if salvation_rng.gen_bool(per) {
                    unavailable.set(page as usize);
                    bad_page_table.insert(idx, page);
                }
            }
        }

        let erased = vec![fresh_erased(&unavailable, pages_in_block); io_unit_in_page];
        let valid = vec![Bitset::new(pages_in_block as usize); io_unit_in_page];
        let dirty = vec![Bitset::new(pages_in_block as usize); io_unit_in_page];
        let cursor = first_available(&unavailable, 0, pages_in_block);
        let next_write_page_index = vec![cursor; io_unit_in_page];
        let lpns = vec![vec![None; io_unit_in_page]; pages_in_block as usize];

        Self {
            idx,
            pages_in_block,
            io_unit_in_page,
            erase_count: 0,
            last_accessed: 0,
            next_write_page_index,
            valid,
            erased,
            dirty,
            lpns,
            unavailable,
        }
    }

    #[must_use]
    pub const fn idx(&self) -> BlockIdx {
        self.idx
    }

    #[must_use]
    pub const fn erase_count(&self) -> u32 {
        self.erase_count
    }

    #[must_use]
    pub const fn last_accessed(&self) -> Tick {
        self.last_accessed
    }

    #[must_use]
    pub const fn pages_in_block(&self) -> u32 {
        self.pages_in_block
    }

    #[must_use]
    pub const fn io_unit_in_page(&self) -> usize {
        self.io_unit_in_page
    }

    #[must_use]
    pub fn next_write_page_index(&self, subunit: usize) -> PageIdx {
        self.next_write_page_index[subunit]
    }

    /// True iff every sub-unit's write cursor has reached the end of
    /// the block, i.e. it is a candidate for GC victim selection.
    #[must_use]
    pub fn is_fully_written(&self) -> bool {
        self.next_write_page_index.iter().all(|&c| c == self.pages_in_block)
    }

    fn check_subunit(&self, subunit: usize) -> Result<(), BlockError> {
        if subunit >= self.io_unit_in_page {
            return Err(BlockError::SubUnitOutOfRange { subunit, io_unit_in_page: self.io_unit_in_page });
        }
        Ok(())
    }

    /// Records a read access; updates `last_accessed` only.
    pub fn read(&mut self, page: PageIdx, subunit: usize, tick: Tick) -> Result<(), BlockError> {
        self.check_subunit(subunit)?;
        debug_assert!(page < self.pages_in_block);
        self.last_accessed = tick;
        Ok(())
    }

    /// Writes `lpn` at `page`/`subunit`, advancing that sub-unit's
    /// cursor past any bad-page run that immediately follows.
    pub fn write(&mut self, page: PageIdx, lpn: Lpn, subunit: usize, tick: Tick) -> Result<(), BlockError> {
        self.check_subunit(subunit)?;
        if !self.erased[subunit].test(page as usize) {
            return Err(BlockError::NotErased { page, subunit });
        }
        if page != self.next_write_page_index[subunit] {
            return Err(BlockError::OutOfOrderWrite { page, subunit, expected: self.next_write_page_index[subunit] });
        }

        self.valid[subunit].set(page as usize);
        self.erased[subunit].clear(page as usize);
        self.dirty[subunit].clear(page as usize);
        self.lpns[page as usize][subunit] = Some(lpn);
        self.last_accessed = tick;
        self.next_write_page_index[subunit] = first_available(&self.unavailable, page + 1, self.pages_in_block);
        Ok(())
    }

    /// Invalidates a previously-written page/sub-unit.
    pub fn invalidate(&mut self, page: PageIdx, subunit: usize) -> Result<(), BlockError> {
        self.check_subunit(subunit)?;
        if !self.valid[subunit].test(page as usize) {
            return Err(BlockError::NotValid { page, subunit });
        }
        self.valid[subunit].clear(page as usize);
        self.dirty[subunit].set(page as usize);
        Ok(())
    }

    /// Erases the block: clears valid/dirty, resets erased to "all
    /// available pages", resets write cursors (skipping any leading
    /// bad-page run), and bumps `erase_count`. The unavailable mask
    /// itself is untouched — defects are permanent.
    ///
    /// # Panics
    /// Panics if any sub-unit still has a valid page; erasing a block
    /// with live data is an invariant-fatal condition for the caller
    /// to have prevented (the GC driver always relocates valid pages
    /// before erasing).
    pub fn erase(&mut self) {
        assert_eq!(self.valid_count(), 0, "erase of block {} with valid data", self.idx);
        for subunit in 0..self.io_unit_in_page {
            self.valid[subunit].clear_all();
            self.dirty[subunit].clear_all();
            self.erased[subunit] = fresh_erased(&self.unavailable, self.pages_in_block);
            self.next_write_page_index[subunit] = first_available(&self.unavailable, 0, self.pages_in_block);
        }
        for page in &mut self.lpns {
            page.iter_mut().for_each(|slot| *slot = None);
        }
        self.erase_count += 1;
    }

    /// Total valid pages across all sub-units.
    #[must_use]
    pub fn valid_count(&self) -> u32 {
        self.valid.iter().map(|b| b.count_ones() as u32).sum()
    }

    /// Number of distinct page indices with at least one valid
    /// sub-unit (a "super-page" count, distinct from `valid_count`'s
    /// per-sub-unit total).
    #[must_use]
    pub fn valid_superpage_count(&self) -> u32 {
        (0..self.pages_in_block)
            .filter(|&p| (0..self.io_unit_in_page).any(|s| self.valid[s].test(p as usize)))
            .count() as u32
    }

    /// Total dirty (written, invalidated, not yet erased) pages across
    /// all sub-units.
    #[must_use]
    pub fn dirty_count(&self) -> u32 {
        self.dirty.iter().map(|b| b.count_ones() as u32).sum()
    }

    #[must_use]
    pub fn unavailable_count(&self) -> u32 {
        self.unavailable.count_ones() as u32
    }

    #[must_use]
    pub fn unavailable_ratio(&self) -> f64 {
        f64::from(self.unavailable_count()) / f64::from(self.pages_in_block)
    }

    #[must_use]
    pub fn is_valid(&self, page: PageIdx, subunit: usize) -> bool {
        self.valid[subunit].test(page as usize)
    }

    #[must_use]
    pub fn lpn_at(&self, page: PageIdx, subunit: usize) -> Option<Lpn> {
        self.lpns[page as usize][subunit]
    }

    /// Snapshot of validity/LPNs at `page` across all sub-units.
    #[must_use]
    pub fn page_info(&self, page: PageIdx) -> PageInfo {
        let valid_mask: Vec<bool> = (0..self.io_unit_in_page).map(|s| self.valid[s].test(page as usize)).collect();
        let lpns = self.lpns[page as usize].clone();
        PageInfo { any_valid: valid_mask.iter().any(|&v| v), valid_mask, lpns }
    }
}
