//! # PageMapping
//!
//! The FTL proper: owns the mapping table, the two block-cluster
//! pools (`cold`/`hot`), the hot-address tracker, and the garbage
//! collector, and exposes the four host entry points (`read`, `write`,
//! `trim`, `format`). Every entry point advances a caller-supplied
//! `tick` by folding in whatever the injected [`Pal`]/[`Dram`]/
//! [`CpuLatencyModel`] report for the PAL/DRAM/CPU work it does.
//!
//! Generic over the three collaborator traits (static dispatch, no
//! trait objects) so a test can plug in [`ftl_pal::FixedLatencyPal`]
//! and friends while a real harness would plug in its own timing
//! model.

mod fill;
mod gc;
mod mapping;
mod pool;

pub use mapping::{LpnRange, MappingEntry, Request};
pub use pool::Pool;

use ftl_badpage::BadPageTable;
use ftl_bitset::Bitset;
use ftl_block::{Block, BlockIdx};
use ftl_cluster::BlockCluster;
use ftl_config::FtlConfig;
use ftl_errormodel::ErrorModel;
use ftl_hotaddr::HotAddressTable;
use ftl_pal::{CpuLatencyModel, CpuOp, Dram, Pal, PhysRequest};
use ftl_stats::{FtlStats, StatsSnapshot};
use mapping::{Lpn, MappingTable, PageIdx};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub type Tick = u64;

/// The FTL core. See the crate-level docs for the entry points.
pub struct PageMapping<P: Pal, D: Dram, C: CpuLatencyModel> {
    pub(crate) config: FtlConfig,
    pub(crate) pools: [BlockCluster; 2],
    pub(crate) mapping: MappingTable,
    pub(crate) hot_addr: HotAddressTable,
    pub(crate) bad_page_table: BadPageTable,
    pub(crate) gc_rng: StdRng,
    pub(crate) stats: FtlStats,
    pub(crate) reclaim_more: bool,
    pub(crate) pal: P,
    pub(crate) dram: D,
    pub(crate) cpu: C,
}

impl<P: Pal, D: Dram, C: CpuLatencyModel> PageMapping<P, D, C> {
    /// Builds the FTL: constructs every physical block (drawing
    /// per-page unavailability from `error_model` when salvation is
    /// enabled), sorts blocks into `cold`/`hot`/dropped, sizes the
    /// hot-address table, and primes each pool's per-plane write
    /// frontiers.
    ///
    /// # Panics
    /// Panics if, while priming frontiers, a pool has no free blocks
    /// of its own and its sibling pool is also out of free blocks —
    /// this is the configuration-fatal "both pools exhausted" case.
    #[must_use]
    pub fn init(config: FtlConfig, pal: P, dram: D, cpu: C, error_model: &mut dyn ErrorModel) -> Self {
        let planes = config.page_count_to_max_perf;
        let mut bad_page_table = BadPageTable::new();
        let mut salvation_rng = StdRng::seed_from_u64(config.salvation_seed);
        let mut pools = [
            BlockCluster::new(planes, config.io_unit_in_page),
            BlockCluster::new(planes, config.io_unit_in_page),
        ];

        for idx in 0..config.total_physical_blocks {
            let block = Block::construct(
                idx,
                config.pages_in_block,
                config.io_unit_in_page,
                config.salvation,
                error_model,
                &mut salvation_rng,
                &mut bad_page_table,
            );
            if !config.salvation.keeps_block(block.unavailable_count(), config.pages_in_block) {
                log::debug!("block {idx} dropped at init: too many unavailable pages");
                continue;
            }
            let pool = if config.hot_cold.enabled && block.unavailable_count() > 0 { Pool::Hot } else { Pool::Cold };
            pools[pool.idx()].seed_free(block);
        }

        let hot_capacity = if config.hot_cold.enabled {
            let writable_hot_pages: u64 = pools[Pool::Hot.idx()]
                .free_iter()
                .map(|b| u64::from(b.pages_in_block() - b.unavailable_count()))
                .sum();
            (writable_hot_pages as f64 * config.hot_cold.capacity_ratio) as usize
        } else {
            0
        };
        let hot_addr = HotAddressTable::new(hot_capacity, config.hot_cold.enabled);

        let mut mapping = Self {
            config,
            pools,
            mapping: MappingTable::new(),
            hot_addr,
            bad_page_table,
            gc_rng: StdRng::seed_from_u64(config.gc_seed),
            stats: FtlStats::new(),
            reclaim_more: false,
            pal,
            dram,
            cpu,
        };

        for pool in Pool::ALL {
            if pool == Pool::Hot && !mapping.config.hot_cold.enabled {
                continue;
            }
            for plane in 0..planes {
                let block = mapping.take_free_block(pool, plane);
                mapping.pools[pool.idx()].prime_plane(plane, block);
            }
        }

        mapping
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let erase_counts = self.pools.iter().flat_map(|c| {
            c.iter().map(|(_, b)| b.erase_count()).chain(c.free_iter().map(Block::erase_count))
        });
        let wear_leveling = ftl_stats::wear_leveling(erase_counts, u64::from(self.config.total_logical_blocks()));
        self.stats.snapshot(wear_leveling, self.hot_addr.hot_len() as u64, self.hot_addr.capacity() as u64)
    }

    #[must_use]
    pub fn bad_page_table(&self) -> &BadPageTable {
        &self.bad_page_table
    }

    #[must_use]
    pub fn mapped_lpn_count(&self) -> usize {
        self.mapping.len()
    }

    /// Reads `req.lpn`. With `use_random_io_tweak` off, every
    /// sub-unit is read regardless of `req.io_flag` (a full-superpage
    /// read); with it on, only the flagged sub-units are touched. A
    /// missing mapping (e.g. after `trim`) is a pure no-op: `tick` is
    /// returned unchanged, with no PAL or CPU charge.
    #[must_use]
    pub fn read(&mut self, req: &Request, tick: Tick) -> Tick {
        if req.io_flag.count_ones() == 0 {
            log::warn!("empty io_flag on read for lpn {}", req.lpn);
            return tick;
        }
        let Some(entry) = self.mapping.get(&req.lpn) else {
            log::trace!("read of unmapped lpn {}", req.lpn);
            return tick;
        };

        let io_unit_in_page = self.config.io_unit_in_page;
        let active: Vec<usize> = if self.config.use_random_io_tweak {
            (0..io_unit_in_page).filter(|&i| req.io_flag.test(i)).collect()
        } else {
            (0..io_unit_in_page).collect()
        };

        let mut touched_any = false;
        let mut max_tick = tick;
        for subunit in active {
            let Some((block_idx, page)) = entry.mapped_slot(subunit) else { continue };
            touched_any = true;
            let pool = self.find_pool(block_idx).expect("fatal: mapped block missing from both clusters");
            self.pools[pool.idx()]
                .get_mut(block_idx)
                .expect("fatal: mapped block missing from owning cluster")
                .read(page, subunit, tick)
                .expect("fatal: read of out-of-range sub-unit");
            let req_one = one_hot_request(block_idx, page, subunit, io_unit_in_page);
            max_tick = max_tick.max(self.pal.read(&req_one, tick));
        }

        if !touched_any {
            return tick;
        }
        self.cpu.charge(CpuOp::PageMappingRead, max_tick)
    }

    /// Writes `req.lpn` at the sub-units named by `req.io_flag`.
    /// `send_to_pal = false` (used by warm-up) skips all PAL/DRAM
    /// accounting and the inline GC trigger, updating only in-memory
    /// state.
    #[must_use]
    pub fn write(&mut self, req: &Request, tick: Tick, send_to_pal: bool) -> Tick {
        if req.io_flag.count_ones() == 0 {
            log::warn!("empty io_flag on write for lpn {}", req.lpn);
            return tick;
        }

        if self.hot_addr.is_enabled() {
            self.hot_addr.update(req.lpn);
        }

        let io_unit_in_page = self.config.io_unit_in_page;
        let mut entry = self.mapping.remove(&req.lpn).unwrap_or_else(|| {
            MappingEntry::sentinel_entry(io_unit_in_page, self.config.total_physical_blocks, self.config.pages_in_block)
        });

        let active: Vec<usize> = req.io_flag.iter_ones().collect();
        for &subunit in &active {
            if let Some((block_idx, page)) = entry.mapped_slot(subunit) {
                let pool = self.find_pool(block_idx).expect("fatal: mapped block missing from both clusters");
                self.pools[pool.idx()]
                    .get_mut(block_idx)
                    .expect("fatal: mapped block missing from owning cluster")
                    .invalidate(page, subunit)
                    .expect("fatal: stale mapping pointed at an already-invalid page");
                entry.clear_slot(subunit);
            }
        }

        let pool = if self.hot_addr.is_enabled() && self.hot_addr.contains(req.lpn) { Pool::Hot } else { Pool::Cold };
        let frontier = self.acquire_frontier(pool, &req.io_flag);
        if frontier.triggered_preemptive_refill {
            self.reclaim_more = true;
        }

        let mut running_tick = tick;
        if send_to_pal {
            let bytes = if self.config.use_random_io_tweak { 8 * active.len() } else { 8 };
            running_tick = self.dram.read(bytes, running_tick);
            running_tick = self.dram.write(bytes, running_tick);
        }

        let read_before_write = !self.config.use_random_io_tweak && !req.io_flag.all();
        let mut complement_read_ticks = Vec::new();
        if read_before_write && send_to_pal {
            for subunit in 0..io_unit_in_page {
                if active.contains(&subunit) {
                    continue;
                }
                if let Some((block_idx, page)) = entry.mapped_slot(subunit) {
                    let req_one = one_hot_request(block_idx, page, subunit, io_unit_in_page);
                    complement_read_ticks.push(self.pal.read(&req_one, running_tick));
                }
            }
        }
        let schedule_tick = complement_read_ticks.into_iter().max().unwrap_or(running_tick);

        let mut write_ticks = Vec::with_capacity(active.len());
        for &subunit in &active {
            let page_index = {
                let block = self.pools[pool.idx()].get(frontier.block).expect("fatal: frontier block vanished");
                block.next_write_page_index(subunit)
            };
            self.pools[pool.idx()]
                .get_mut(frontier.block)
                .expect("fatal: frontier block vanished")
                .write(page_index, req.lpn, subunit, running_tick)
                .expect("fatal: frontier write violated block invariants");
            entry.set_slot(subunit, frontier.block, page_index);
            if send_to_pal {
                let req_one = one_hot_request(frontier.block, page_index, subunit, io_unit_in_page);
                write_ticks.push(self.pal.write(&req_one, schedule_tick));
            }
        }
        let after_writes = write_ticks.into_iter().max().unwrap_or(schedule_tick);

        self.mapping.insert(req.lpn, entry);

        let final_tick = if send_to_pal { self.cpu.charge(CpuOp::PageMappingWrite, after_writes) } else { after_writes };

        if send_to_pal { self.run_gc(final_tick) } else { final_tick }
    }

    /// Invalidates every mapped sub-unit of `lpn` and removes its
    /// mapping entry. No PAL I/O, CPU latency only.
    #[must_use]
    pub fn trim(&mut self, lpn: Lpn, tick: Tick) -> Tick {
        if let Some(entry) = self.mapping.remove(&lpn) {
            for subunit in 0..entry.io_unit_in_page() {
                if let Some((block_idx, page)) = entry.mapped_slot(subunit) {
                    let pool = self.find_pool(block_idx).expect("fatal: mapped block missing from both clusters");
                    self.pools[pool.idx()]
                        .get_mut(block_idx)
                        .expect("fatal: mapped block missing from owning cluster")
                        .invalidate(page, subunit)
                        .expect("fatal: trim of an already-invalid page");
                }
            }
        }
        self.cpu.charge(CpuOp::PageMappingTrim, tick)
    }

    /// Trims every LPN in `range`, then runs GC restricted to exactly
    /// the set of blocks those trims touched.
    #[must_use]
    pub fn format(&mut self, range: LpnRange, tick: Tick) -> Tick {
        let mut touched: std::collections::HashMap<Pool, std::collections::HashSet<BlockIdx>> =
            std::collections::HashMap::new();
        for offset in 0..range.nlp {
            let lpn = range.slpn + offset;
            let Some(entry) = self.mapping.remove(&lpn) else { continue };
            for subunit in 0..entry.io_unit_in_page() {
                if let Some((block_idx, page)) = entry.mapped_slot(subunit) {
                    let pool = self.find_pool(block_idx).expect("fatal: mapped block missing from both clusters");
                    self.pools[pool.idx()]
                        .get_mut(block_idx)
                        .expect("fatal: mapped block missing from owning cluster")
                        .invalidate(page, subunit)
                        .expect("fatal: format of an already-invalid page");
                    touched.entry(pool).or_default().insert(block_idx);
                }
            }
        }

        let after_cpu = self.cpu.charge(CpuOp::PageMappingFormat, tick);
        let victims: Vec<(Pool, Vec<BlockIdx>)> =
            touched.into_iter().map(|(pool, set)| (pool, set.into_iter().collect())).collect();
        self.reclaim(victims, after_cpu)
    }

    pub(crate) fn find_pool(&self, block: BlockIdx) -> Option<Pool> {
        Pool::ALL.into_iter().find(|&pool| self.pools[pool.idx()].contains(block))
    }

    pub(crate) fn total_free_blocks(&self) -> u32 {
        self.pools.iter().map(|c| c.free_count() as u32).sum()
    }

    pub(crate) fn acquire_frontier(&mut self, pool: Pool, iomap: &Bitset) -> ftl_cluster::Frontier {
        let random_tweak = self.config.use_random_io_tweak;
        let (this_cluster, other_cluster) = if pool.idx() == 0 {
            let (a, b) = self.pools.split_at_mut(1);
            (&mut a[0], &mut b[0])
        } else {
            let (a, b) = self.pools.split_at_mut(1);
            (&mut b[0], &mut a[0])
        };
        this_cluster.get_frontier(iomap, random_tweak, &mut |plane| {
            this_cluster_fallback(this_cluster, other_cluster, plane)
        })
    }

    pub(crate) fn take_free_block(&mut self, pool: Pool, plane: usize) -> Block {
        if let Some(b) = self.pools[pool.idx()].take_free_for_plane(plane) {
            return b;
        }
        let other = pool.opposite();
        self.pools[other.idx()]
            .take_any_free()
            .unwrap_or_else(|| panic!("fatal: pool {pool:?} and its sibling are both out of free blocks"))
    }
}

fn this_cluster_fallback(this: &mut BlockCluster, other: &mut BlockCluster, plane: usize) -> Block {
    if let Some(b) = this.take_free_for_plane(plane) {
        return b;
    }
    other.take_any_free().expect("fatal: both pools are out of free blocks during preemptive refill")
}

fn one_hot_request(block: BlockIdx, page: PageIdx, subunit: usize, io_unit_in_page: usize) -> PhysRequest {
    let mut io_flag = Bitset::new(io_unit_in_page);
    io_flag.set(subunit);
    PhysRequest { block, page, io_flag }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_config::{EvictPolicy, FillingConfig, FillingMode, GcConfig, GcMode, HotColdConfig};
    use ftl_errormodel::LogNormal;
    use ftl_pal::{NullCpu, NullDram, NullPal, Parameter};
    use ftl_salvation::SalvationConfig;

    // pagesInBlock=4, 1 sub-unit, 4 physical blocks, overprovision 0.25
    // -> 3 logical blocks (12 logical pages), hot/cold off.
    fn config(threshold_ratio: f64, salvation: SalvationConfig) -> FtlConfig {
        FtlConfig {
            total_physical_blocks: 4,
            pages_in_block: 4,
            io_unit_in_page: 1,
            page_count_to_max_perf: 1,
            overprovision_ratio: 0.25,
            use_random_io_tweak: false,
            ber: 1e-6,
            sigma: 0.5,
            hot_cold: HotColdConfig { enabled: false, capacity_ratio: 0.0 },
            gc: GcConfig {
                mode: GcMode::Threshold,
                evict_policy: EvictPolicy::Greedy,
                d_choice_param: 1,
                reclaim_block: 1,
                reclaim_threshold: 1,
                threshold_ratio,
            },
            salvation,
            filling: FillingConfig { fill_ratio: 0.0, invalid_page_ratio: 0.0, mode: FillingMode::SeqSeq },
            salvation_seed: 1,
            error_model_seed: 2,
            gc_seed: 3,
        }
    }

    fn fresh(threshold_ratio: f64) -> PageMapping<NullPal, NullDram, NullCpu> {
        fresh_with(config(threshold_ratio, SalvationConfig::disabled()))
    }

    fn fresh_with(cfg: FtlConfig) -> PageMapping<NullPal, NullDram, NullCpu> {
        let mut model = LogNormal::new(cfg.ber, cfg.sigma, 4096, cfg.error_model_seed);
        PageMapping::init(cfg, NullPal { info: Parameter::default() }, NullDram, NullCpu, &mut model)
    }

    fn req(lpn: Lpn) -> Request {
        Request { lpn, io_flag: Bitset::new_all_set(1) }
    }

    #[test]
    fn sequential_fill_to_capacity_triggers_no_gc() {
        // threshold_ratio = 0.0: the inline trigger is a strict `<`, so a
        // free-block ratio that bottoms out at exactly zero (all 12
        // logical pages fit in the 3 non-reserve physical blocks, with
        // the 4th already swapped in as the empty next frontier) never
        // fires it.
        let mut m = fresh(0.0);
        let mut tick = 0;
        for lpn in 0..12u64 {
            tick = m.write(&req(lpn), tick, true);
        }
        assert_eq!(m.stats_snapshot().gc_count, 0);
        assert_eq!(m.mapped_lpn_count(), 12);
        assert_eq!(m.total_free_blocks(), 0);
    }

    #[test]
    fn double_write_invalidates_first_slot() {
        let mut m = fresh(0.0);
        let tick = m.write(&req(0), 0, true);
        let (first_block, _) = m.mapping.get(&0).unwrap().mapped_slot(0).unwrap();
        m.write(&req(0), tick, true);

        let pool = m.find_pool(first_block).unwrap();
        let block = m.pools[pool.idx()].get(first_block).unwrap();
        assert_eq!(block.dirty_count(), 1);
        assert_eq!(block.valid_count(), 0);
    }

    #[test]
    fn rewrite_after_fill_triggers_gc_and_keeps_all_lpns_readable() {
        let mut m = fresh(0.5);
        let mut tick = 0;
        for lpn in 0..12u64 {
            tick = m.write(&req(lpn), tick, true);
        }
        for lpn in 0..4u64 {
            tick = m.write(&req(lpn), tick, true);
        }

        let snap = m.stats_snapshot();
        assert!(snap.gc_count >= 1, "rewriting a full device must eventually reclaim space");
        assert!(snap.gc_reclaimed_blocks >= 1);
        for lpn in 0..12u64 {
            assert!(m.mapping.contains_key(&lpn), "lpn {lpn} lost across GC");
            let entry = m.mapping.get(&lpn).unwrap();
            let (block_idx, page) = entry.mapped_slot(0).expect("every lpn must still resolve to a live page");
            let pool = m.find_pool(block_idx).unwrap();
            let block = m.pools[pool.idx()].get(block_idx).unwrap();
            assert!(block.is_valid(page, 0), "lpn {lpn}'s mapped page must be live post-GC");
        }
    }

    #[test]
    fn trim_then_read_is_a_pure_no_op() {
        let mut m = fresh(0.0);
        let tick = m.write(&req(5), 0, true);
        let after_trim = m.trim(5, tick);
        assert_eq!(m.mapped_lpn_count(), 0);
        let after_read = m.read(&req(5), after_trim);
        assert_eq!(after_read, after_trim, "read of an unmapped lpn must not advance tick");
    }

    #[test]
    fn format_range_clears_mappings_and_reclaims_touched_blocks() {
        let mut m = fresh(0.0);
        let mut tick = 0;
        for lpn in 0..4u64 {
            tick = m.write(&req(lpn), tick, true);
        }
        m.format(LpnRange { slpn: 0, nlp: 4 }, tick);
        for lpn in 0..4u64 {
            assert!(!m.mapping.contains_key(&lpn));
        }
    }

    #[test]
    fn salvation_drop_vs_keep_is_a_strict_less_than_boundary() {
        struct Scripted {
            calls: usize,
            bad_at: usize,
        }
        impl ftl_errormodel::ErrorModel for Scripted {
            fn ber(&self) -> f64 {
                0.0
            }
            fn per(&mut self) -> f64 {
                self.calls += 1;
                if self.calls == self.bad_at { 1.0 } else { 0.0 }
            }
            fn describe(&self) -> &str {
                "scripted"
            }
        }

        // Block index 1's single page (pages_in_block=1) is flagged bad,
        // so its unavailable ratio is 1/1 = 1.0, which fails a strict
        // `< 0.25` keep-threshold and must be dropped on construction.
        let mut cfg = config(0.0, SalvationConfig { enabled: true, unavailable_page_threshold: 0.25 });
        cfg.pages_in_block = 1;
        let mut model = Scripted { calls: 0, bad_at: 2 };
        let m = PageMapping::init(cfg, NullPal { info: Parameter::default() }, NullDram, NullCpu, &mut model);

        assert_eq!(m.total_free_blocks() + m.pools.iter().map(|c| c.in_use_count() as u32).sum::<u32>(), 3);
    }
}
