//! # BlockCluster
//!
//! One pool's worth of blocks: the in-use set, the free list (kept in
//! non-decreasing erase-count order), and the per-plane write
//! frontiers used to stripe writes for sequential read-back
//! performance. A `BlockCluster` never reaches into its sibling pool —
//! cross-pool free-block lending is a caller concern (the pool set one
//! level up owns both clusters and can see both free lists at once).

use ftl_bitset::Bitset;
use ftl_block::{Block, BlockIdx};
use std::collections::{HashMap, VecDeque};

/// Result of a frontier lookup: which block to write into, and whether
/// servicing this request used up that block's last page, forcing a
/// preemptive free-block allocation for the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontier {
    pub block: BlockIdx,
    pub plane: usize,
    pub triggered_preemptive_refill: bool,
}

/// One pool partition's in-use blocks, free list, and write frontiers.
pub struct BlockCluster {
    blocks: HashMap<BlockIdx, Block>,
    free_blocks: VecDeque<Block>,
    page_count_to_max_perf: usize,
    last_free_block: Vec<Option<BlockIdx>>,
    last_free_block_io_map: Bitset,
    last_free_block_index: usize,
}

impl BlockCluster {
    /// Creates an empty cluster striping writes across
    /// `page_count_to_max_perf` planes.
    ///
    /// # Panics
    /// Panics if `page_count_to_max_perf` is zero.
    #[must_use]
    pub fn new(page_count_to_max_perf: usize, io_unit_in_page: usize) -> Self {
        assert!(page_count_to_max_perf > 0, "page_count_to_max_perf must be positive");
        Self {
            blocks: HashMap::new(),
            free_blocks: VecDeque::new(),
            page_count_to_max_perf,
            last_free_block: vec![None; page_count_to_max_perf],
            last_free_block_io_map: Bitset::new(io_unit_in_page),
            // Primed one behind plane 0 so the very first getFrontier
            // rotation (which always happens before bRandomTweak is
            // consulted, since no prior iomap has been recorded) lands
            // on plane 0 rather than plane 1.
            last_free_block_index: page_count_to_max_perf - 1,
        }
    }

    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_blocks.len()
    }

    #[must_use]
    pub fn contains(&self, idx: BlockIdx) -> bool {
        self.blocks.contains_key(&idx)
    }

    #[must_use]
    pub fn get(&self, idx: BlockIdx) -> Option<&Block> {
        self.blocks.get(&idx)
    }

    #[must_use]
    pub fn get_mut(&mut self, idx: BlockIdx) -> Option<&mut Block> {
        self.blocks.get_mut(&idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockIdx, &Block)> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.values_mut()
    }

    /// Iterates the free list in its current (ascending erase-count)
    /// order, without removing anything.
    pub fn free_iter(&self) -> impl Iterator<Item = &Block> {
        self.free_blocks.iter()
    }

    /// Registers `block` as a currently-unassigned free block of this
    /// cluster, not yet placed at any plane's frontier. Used only
    /// during initial population; once priming is complete, blocks
    /// return via [`BlockCluster::retire`].
    pub fn seed_free(&mut self, block: Block) {
        self.insert_free_sorted(block);
    }

    /// Moves a block from the free list into the in-use set and primes
    /// `plane`'s write frontier to point at it. Called once per plane
    /// at startup, and again whenever a preemptive refill needs a
    /// frontier that was never primed (should not normally happen
    /// after startup, since `get_frontier` refills ahead of
    /// exhaustion).
    pub fn prime_plane(&mut self, plane: usize, block: Block) {
        let idx = block.idx();
        self.blocks.insert(idx, block);
        self.last_free_block[plane] = Some(idx);
    }

    /// Takes a free block matching `plane`'s stripe (`idx % planes ==
    /// plane`), falling back to the lowest-erase-count free block of
    /// any plane. Returns `None` if the free list is empty; the caller
    /// is then responsible for cross-pool lending.
    pub fn take_free_for_plane(&mut self, plane: usize) -> Option<Block> {
        if let Some(pos) = self
            .free_blocks
            .iter()
            .position(|b| (b.idx() as usize) % self.page_count_to_max_perf == plane)
        {
            self.free_blocks.remove(pos)
        } else {
            self.free_blocks.pop_front()
        }
    }

    /// Takes the lowest-erase-count free block regardless of plane,
    /// for lending to a sibling cluster that has run dry.
    pub fn take_any_free(&mut self) -> Option<Block> {
        self.free_blocks.pop_front()
    }

    /// Looks up the write frontier for the sub-units named by `iomap`,
    /// rotating to the next plane when `bRandomTweak` is disabled or
    /// when `iomap` overlaps the sub-units already claimed at the
    /// current plane this round. When the frontier block's next write
    /// would land on its last page, preemptively swaps in a fresh free
    /// block obtained from `free_supply` (local pool first, then
    /// whatever cross-pool fallback the caller wires in) so the next
    /// lookup for this plane is already primed.
    ///
    /// # Panics
    /// Panics if a plane has never been primed via
    /// [`BlockCluster::prime_plane`].
    pub fn get_frontier(
        &mut self,
        iomap: &Bitset,
        random_tweak: bool,
        free_supply: &mut dyn FnMut(usize) -> Block,
    ) -> Frontier {
        let rotate = !random_tweak || self.last_free_block_io_map.intersects(iomap);
        if rotate {
            self.last_free_block_index = (self.last_free_block_index + 1) % self.page_count_to_max_perf;
            self.last_free_block_io_map = iomap.clone();
        } else {
            self.last_free_block_io_map.union_with(iomap);
        }

        let plane = self.last_free_block_index;
        let frontier_idx = self.last_free_block[plane].expect("write frontier not primed for plane");

        let mut triggered = false;
        let would_exhaust = {
            let block = self.blocks.get(&frontier_idx).expect("frontier block missing from in-use set");
            (0..block.io_unit_in_page())
                .filter(|&s| iomap.test(s))
                .any(|s| block.next_write_page_index(s) + 1 == block.pages_in_block())
        };
        if would_exhaust {
            let fresh = free_supply(plane);
            let fresh_idx = fresh.idx();
            self.blocks.insert(fresh_idx, fresh);
            self.last_free_block[plane] = Some(fresh_idx);
            triggered = true;
        }

        Frontier { block: frontier_idx, plane, triggered_preemptive_refill: triggered }
    }

    /// Removes a fully-written, fully-invalid block from the in-use
    /// set so it can be erased by the caller and returned via
    /// [`BlockCluster::retire`].
    pub fn take_in_use(&mut self, idx: BlockIdx) -> Option<Block> {
        self.blocks.remove(&idx)
    }

    /// Returns a freshly-erased block to the free list, keeping the
    /// list in non-decreasing erase-count order by scanning back from
    /// the tail (erase counts only ever grow, so newly erased blocks
    /// are usually already at or near the back).
    pub fn retire(&mut self, block: Block) {
        self.insert_free_sorted(block);
    }

    fn insert_free_sorted(&mut self, block: Block) {
        let mut pos = self.free_blocks.len();
        while pos > 0 && self.free_blocks[pos - 1].erase_count() > block.erase_count() {
            pos -= 1;
        }
        self.free_blocks.insert(pos, block);
    }
}
