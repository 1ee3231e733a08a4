//! Victim selection and the reclaim pass.

use crate::mapping::{BlockIdx, Lpn, PageIdx};
use crate::pool::Pool;
use crate::{PageMapping, Tick, one_hot_request};
use ftl_bitset::Bitset;
use ftl_config::{EvictPolicy, GcMode};
use ftl_pal::{CpuLatencyModel, CpuOp, Dram, Pal};
use rand::seq::index::sample;

impl<P: Pal, D: Dram, C: CpuLatencyModel> PageMapping<P, D, C> {
    /// Computes how many blocks to reclaim this cycle, folding in a
    /// preemptive top-up raised by the allocator when a write consumed
    /// a frontier's last page (`reclaim_more`).
    fn gc_block_budget(&mut self) -> usize {
        let total_free = self.total_free_blocks();
        let mut n = match self.config.gc.mode {
            GcMode::Fixed => self.config.gc.reclaim_block,
            GcMode::Threshold => {
                let target = (f64::from(self.config.total_physical_blocks) * self.config.gc.threshold_ratio) as i64;
                (target - i64::from(total_free)).max(0) as usize
            }
        };
        if self.reclaim_more {
            n += self.config.page_count_to_max_perf;
            self.reclaim_more = false;
        }
        n.max(1)
    }

    fn should_trigger(&self) -> bool {
        let total_free = self.total_free_blocks();
        match self.config.gc.mode {
            GcMode::Fixed => total_free < self.config.gc.reclaim_threshold as u32,
            GcMode::Threshold => {
                f64::from(total_free) / f64::from(self.config.total_physical_blocks) < self.config.gc.threshold_ratio
            }
        }
    }

    /// Runs one full GC cycle, or returns `tick` unchanged if
    /// `should_trigger` says the free-block supply is still healthy.
    /// Called inline after every `write` that reaches the PAL. `format`
    /// reclaims its touched blocks via `reclaim` directly instead,
    /// bypassing `should_trigger` since those blocks must go regardless.
    pub(crate) fn run_gc(&mut self, tick: Tick) -> Tick {
        if !self.should_trigger() {
            return tick;
        }
        let budget = self.gc_block_budget();
        let victims: Vec<(Pool, Vec<BlockIdx>)> =
            Pool::ALL.into_iter().map(|pool| (pool, self.select_victims(pool, budget, tick))).collect();
        self.reclaim(victims, tick)
    }

    fn select_victims(&mut self, pool: Pool, budget: usize, now: Tick) -> Vec<BlockIdx> {
        let pages_in_block = f64::from(self.config.pages_in_block);
        let policy = self.config.gc.evict_policy;
        let candidates: Vec<(BlockIdx, f64)> = self.pools[pool.idx()]
            .iter()
            .filter(|(_, b)| b.is_fully_written())
            .map(|(&idx, b)| {
                let weight = match policy {
                    EvictPolicy::Greedy | EvictPolicy::Random | EvictPolicy::DChoice => f64::from(b.valid_count()),
                    EvictPolicy::CostBenefit => {
                        let u = f64::from(b.valid_count()) / pages_in_block;
                        let age = now.saturating_sub(b.last_accessed());
                        if age == 0 || (1.0 - u) <= 0.0 { f64::INFINITY } else { u / ((1.0 - u) * age as f64) }
                    }
                };
                (idx, weight)
            })
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        match policy {
            EvictPolicy::Greedy | EvictPolicy::CostBenefit => {
                let mut sorted = candidates;
                sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
                sorted.into_iter().take(budget).map(|(idx, _)| idx).collect()
            }
            EvictPolicy::Random => {
                let k = budget.min(candidates.len());
                sample(&mut self.gc_rng, candidates.len(), k).into_iter().map(|i| candidates[i].0).collect()
            }
            EvictPolicy::DChoice => {
                let pool_size = (budget * self.config.gc.d_choice_param).min(candidates.len());
                let mut sampled: Vec<(BlockIdx, f64)> =
                    sample(&mut self.gc_rng, candidates.len(), pool_size).into_iter().map(|i| candidates[i]).collect();
                sampled.sort_by(|a, b| a.1.total_cmp(&b.1));
                sampled.into_iter().take(budget).map(|(idx, _)| idx).collect()
            }
        }
    }

    /// Relocates every valid page of `victims` into the cold cluster,
    /// then erases and re-homes (or drops) each victim. Scheduling
    /// follows a three-phase pattern: all relocation reads are issued
    /// in parallel against the entry tick; all relocation writes and
    /// all victim erases then start in parallel from the reads'
    /// completion; the cycle's tick is `max(writes, erases)` plus CPU
    /// latency.
    pub(crate) fn reclaim(&mut self, victims: Vec<(Pool, Vec<BlockIdx>)>, tick: Tick) -> Tick {
        self.stats.record_gc_cycle();

        let mut read_reqs = Vec::new();
        let mut write_reqs = Vec::new();
        let mut erase_list: Vec<(Pool, BlockIdx)> = Vec::new();
        let io_unit_in_page = self.config.io_unit_in_page;
        let pages_in_block = self.config.pages_in_block;

        for (pool, blocks) in victims {
            for block_idx in blocks {
                let valid_by_page: Vec<(PageIdx, Vec<(usize, Lpn)>)> = {
                    let block = self.pools[pool.idx()].get(block_idx).expect("fatal: GC victim missing from cluster");
                    (0..pages_in_block)
                        .filter_map(|page| {
                            let subunits: Vec<(usize, Lpn)> = (0..io_unit_in_page)
                                .filter(|&i| block.is_valid(page, i))
                                .map(|i| (i, block.lpn_at(page, i).expect("fatal: valid page with no LPN")))
                                .collect();
                            if subunits.is_empty() { None } else { Some((page, subunits)) }
                        })
                        .collect()
                };

                let valid_count: u32 = valid_by_page.iter().map(|(_, s)| s.len() as u32).sum();
                self.stats.record_reclaimed_block(valid_count);

                for (old_page, subunits) in valid_by_page {
                    self.stats.record_superpage_copy();
                    let mut iomap = Bitset::new(io_unit_in_page);
                    for &(i, _) in &subunits {
                        iomap.set(i);
                    }
                    let frontier = self.acquire_frontier(Pool::Cold, &iomap);
                    if frontier.triggered_preemptive_refill {
                        self.reclaim_more = true;
                    }

                    for (subunit, lpn) in subunits {
                        self.pools[pool.idx()]
                            .get_mut(block_idx)
                            .expect("fatal: GC victim vanished mid-reclaim")
                            .invalidate(old_page, subunit)
                            .expect("fatal: GC tried to invalidate an already-invalid page");
                        read_reqs.push(one_hot_request(block_idx, old_page, subunit, io_unit_in_page));

                        let new_page = {
                            let cold = self.pools[Pool::Cold.idx()].get(frontier.block).expect("fatal: cold frontier vanished");
                            cold.next_write_page_index(subunit)
                        };
                        self.pools[Pool::Cold.idx()]
                            .get_mut(frontier.block)
                            .expect("fatal: cold frontier vanished")
                            .write(new_page, lpn, subunit, tick)
                            .expect("fatal: GC relocation write violated block invariants");
                        write_reqs.push(one_hot_request(frontier.block, new_page, subunit, io_unit_in_page));

                        if let Some(entry) = self.mapping.get_mut(&lpn) {
                            entry.set_slot(subunit, frontier.block, new_page);
                        }
                        self.stats.record_page_copy();
                    }
                }

                erase_list.push((pool, block_idx));
            }
        }

        let read_finished_at = read_reqs.iter().fold(tick, |acc, req| acc.max(self.pal.read(req, tick)));
        let write_finished_at =
            write_reqs.iter().fold(read_finished_at, |acc, req| acc.max(self.pal.write(req, read_finished_at)));
        let erase_finished_at =
            erase_list.iter().fold(read_finished_at, |acc, (_, idx)| acc.max(self.pal.erase(*idx, read_finished_at)));

        for (pool, block_idx) in erase_list {
            let mut block = self.pools[pool.idx()].take_in_use(block_idx).expect("fatal: GC victim vanished before erase");
            block.erase();
            let keeps = self.config.salvation.keeps_block(block.unavailable_count(), self.config.pages_in_block);
            if keeps {
                let destination =
                    if self.config.hot_cold.enabled && block.unavailable_count() > 0 { Pool::Hot } else { Pool::Cold };
                self.pools[destination.idx()].retire(block);
            } else {
                log::debug!("block {block_idx} dropped after GC: too many unavailable pages");
            }
        }

        self.cpu.charge(CpuOp::GcReclaim, write_finished_at.max(erase_finished_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_config::{FillingConfig, FillingMode, FtlConfig, HotColdConfig};
    use ftl_errormodel::LogNormal;
    use ftl_pal::{NullCpu, NullDram, NullPal, Parameter};
    use ftl_salvation::SalvationConfig;

    fn config(evict_policy: EvictPolicy, d_choice_param: usize) -> FtlConfig {
        FtlConfig {
            total_physical_blocks: 4,
            pages_in_block: 2,
            io_unit_in_page: 1,
            page_count_to_max_perf: 1,
            overprovision_ratio: 0.25,
            use_random_io_tweak: false,
            ber: 1e-6,
            sigma: 0.5,
            hot_cold: HotColdConfig { enabled: false, capacity_ratio: 0.0 },
            gc: GcConfig {
                mode: GcMode::Threshold,
                evict_policy,
                d_choice_param,
                reclaim_block: 1,
                reclaim_threshold: 1,
                threshold_ratio: 0.0,
            },
            salvation: SalvationConfig::disabled(),
            filling: FillingConfig { fill_ratio: 0.0, invalid_page_ratio: 0.0, mode: FillingMode::SeqSeq },
            salvation_seed: 1,
            error_model_seed: 2,
            gc_seed: 9,
        }
    }

    fn harness(evict_policy: EvictPolicy, d_choice_param: usize) -> PageMapping<NullPal, NullDram, NullCpu> {
        let cfg = config(evict_policy, d_choice_param);
        let mut model = LogNormal::new(cfg.ber, cfg.sigma, 4096, cfg.error_model_seed);
        PageMapping::init(cfg, NullPal { info: Parameter::default() }, NullDram, NullCpu, &mut model)
    }

    fn write(m: &mut PageMapping<NullPal, NullDram, NullCpu>, lpn: Lpn, tick: Tick) {
        // send_to_pal = false: GC candidate selection doesn't need the
        // inline trigger to have fired.
        m.write(&crate::mapping::Request { lpn, io_flag: Bitset::new_all_set(1) }, tick, false);
    }

    #[test]
    fn greedy_picks_the_least_valid_block() {
        let mut m = harness(EvictPolicy::Greedy, 1);
        // Block A (lpn 0,1) stays fully valid; block B (lpn 2,3) has one
        // of its two pages trimmed, so it is the cheaper victim.
        write(&mut m, 0, 0);
        write(&mut m, 1, 0);
        write(&mut m, 2, 0);
        write(&mut m, 3, 0);
        m.trim(2, 0);

        let (block_b, _) = m.mapping.get(&3).unwrap().mapped_slot(0).unwrap();
        let victims = m.select_victims(Pool::Cold, 1, 0);
        assert_eq!(victims, vec![block_b]);
    }

    #[test]
    fn cost_benefit_deprioritizes_zero_age_candidates() {
        let mut m = harness(EvictPolicy::CostBenefit, 1);
        // Block A written at tick 0 and never touched again (ages as
        // `now` advances): low utilization after a trim, high age.
        write(&mut m, 0, 0);
        write(&mut m, 1, 0);
        m.trim(0, 0);
        let (block_a, _) = m.mapping.get(&1).unwrap().mapped_slot(0).unwrap();

        // Block B written at `now` itself: age == 0, must never be
        // preferred over a finite-weight candidate even though it is
        // also partially invalid.
        write(&mut m, 2, 100);
        write(&mut m, 3, 100);
        m.trim(2, 100);

        let victims = m.select_victims(Pool::Cold, 1, 100);
        assert_eq!(victims, vec![block_a]);
    }

    #[test]
    fn random_and_dchoice_never_exceed_budget_or_candidate_pool() {
        for policy in [EvictPolicy::Random, EvictPolicy::DChoice] {
            let mut m = harness(policy, 2);
            for lpn in 0..4u64 {
                write(&mut m, lpn, 0);
            }
            let victims = m.select_victims(Pool::Cold, 1, 10);
            assert_eq!(victims.len(), 1);
        }
    }

    #[test]
    fn no_fully_written_candidates_returns_empty() {
        let mut m = harness(EvictPolicy::Greedy, 1);
        write(&mut m, 0, 0);
        let victims = m.select_victims(Pool::Cold, 1, 0);
        assert!(victims.is_empty());
    }
}
