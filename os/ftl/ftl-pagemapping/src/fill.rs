//! Warm-up fill: populates a freshly initialized FTL with a
//! synthetic write/invalidate workload before real traffic starts.

use crate::mapping::{Lpn, Request};
use crate::{PageMapping, Tick};
use ftl_bitset::Bitset;
use ftl_config::FillingMode;
use ftl_pal::{CpuLatencyModel, Dram, Pal};
use rand::Rng;

impl<P: Pal, D: Dram, C: CpuLatencyModel> PageMapping<P, D, C> {
    /// Total logical pages addressable by the host (one LPN per
    /// super-page, across every logical block).
    #[must_use]
    pub fn total_logical_pages(&self) -> u64 {
        u64::from(self.config.total_logical_blocks()) * u64::from(self.config.pages_in_block)
    }

    /// Writes `fill_ratio · total_logical_pages` LPNs, then rewrites
    /// `invalid_page_ratio · total_logical_pages` of them to generate
    /// dirty pages, in the order named by the configured
    /// [`FillingMode`]. Every write goes through with
    /// `send_to_pal = false`, so this never triggers GC and never
    /// touches the PAL/DRAM/CPU models.
    #[must_use]
    pub fn warm_up(&mut self, tick: Tick) -> Tick {
        let total = self.total_logical_pages();
        let mut n_fill = (total as f64 * self.config.filling.fill_ratio) as u64;
        let mut n_inv = (total as f64 * self.config.filling.invalid_page_ratio) as u64;
        n_fill = n_fill.min(total);

        let pre_gc_budget = u64::from(self.config.total_physical_blocks) * u64::from(self.config.pages_in_block);
        if n_fill + n_inv > pre_gc_budget {
            log::warn!("warm-up fill + invalidate ({}+{}) exceeds pre-GC page budget {pre_gc_budget}; clamping", n_fill, n_inv);
            n_inv = pre_gc_budget.saturating_sub(n_fill);
        }

        let mode = self.config.filling.mode;
        let io_flag = Bitset::new_all_set(self.config.io_unit_in_page);
        let mut tick = tick;

        let fill_sequence: Vec<Lpn> = match mode {
            FillingMode::SeqSeq | FillingMode::SeqBoundedRandom => (0..n_fill).collect(),
            FillingMode::RandomUnbounded => {
                (0..n_fill).map(|_| self.gc_rng.gen_range(0..total.max(1))).collect()
            }
        };
        for lpn in fill_sequence {
            tick = self.write(&Request { lpn, io_flag: io_flag.clone() }, tick, false);
        }

        let invalidate_sequence: Vec<Lpn> = match mode {
            FillingMode::SeqSeq => (0..n_inv).collect(),
            FillingMode::SeqBoundedRandom => {
                let bound = n_fill.max(1);
                (0..n_inv).map(|_| self.gc_rng.gen_range(0..bound)).collect()
            }
            FillingMode::RandomUnbounded => (0..n_inv).map(|_| self.gc_rng.gen_range(0..total.max(1))).collect(),
        };
        for lpn in invalidate_sequence {
            tick = self.write(&Request { lpn, io_flag: io_flag.clone() }, tick, false);
        }

        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_config::{EvictPolicy, FillingConfig, FtlConfig, GcConfig, GcMode, HotColdConfig};
    use ftl_errormodel::LogNormal;
    use ftl_pal::{NullCpu, NullDram, NullPal, Parameter};
    use ftl_salvation::SalvationConfig;

    fn config(fill_ratio: f64, invalid_page_ratio: f64, mode: FillingMode) -> FtlConfig {
        FtlConfig {
            total_physical_blocks: 8,
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
                threshold_ratio: 0.0,
            },
            salvation: SalvationConfig::disabled(),
            filling: FillingConfig { fill_ratio, invalid_page_ratio, mode },
            salvation_seed: 1,
            error_model_seed: 2,
            gc_seed: 3,
        }
    }

    fn harness(fill_ratio: f64, invalid_page_ratio: f64, mode: FillingMode) -> PageMapping<NullPal, NullDram, NullCpu> {
        let cfg = config(fill_ratio, invalid_page_ratio, mode);
        let mut model = LogNormal::new(cfg.ber, cfg.sigma, 4096, cfg.error_model_seed);
        PageMapping::init(cfg, NullPal { info: Parameter::default() }, NullDram, NullCpu, &mut model)
    }

    #[test]
    fn seq_seq_fills_the_requested_ratio_and_never_touches_the_pal() {
        let mut m = harness(0.5, 0.0, FillingMode::SeqSeq);
        let total = m.total_logical_pages();
        let returned_tick = m.warm_up(42);
        assert_eq!(returned_tick, 42, "send_to_pal=false must leave tick untouched");
        assert_eq!(m.mapped_lpn_count(), (total as f64 * 0.5) as usize);
        assert_eq!(m.stats_snapshot().gc_count, 0);
    }

    #[test]
    fn seq_seq_invalidation_keeps_every_lpn_mapped() {
        let mut m = harness(1.0, 0.25, FillingMode::SeqSeq);
        let total = m.total_logical_pages();
        m.warm_up(0);
        // Rewrites replace the slot behind an lpn, they don't unmap it,
        // so every originally-filled lpn is still resolvable.
        assert_eq!(m.mapped_lpn_count(), total as usize);
    }

    #[test]
    fn over_subscription_clamps_invalidate_count_instead_of_running_gc() {
        // fill_ratio=1.0 + invalid_page_ratio=1.0 asks for twice the
        // pre-GC page budget; warm_up must clamp n_inv rather than ever
        // reach a GC cycle (send_to_pal is always false here).
        let mut m = harness(1.0, 1.0, FillingMode::SeqSeq);
        m.warm_up(0);
        assert_eq!(m.stats_snapshot().gc_count, 0);
    }

    #[test]
    fn random_unbounded_never_exceeds_total_logical_pages() {
        let mut m = harness(0.5, 0.5, FillingMode::RandomUnbounded);
        m.warm_up(0);
        assert!(m.mapped_lpn_count() as u64 <= m.total_logical_pages());
        assert_eq!(m.stats_snapshot().gc_count, 0);
    }

    #[test]
    fn seq_bounded_random_invalidates_only_within_the_filled_range() {
        // SeqBoundedRandom draws its invalidate targets from 0..n_fill,
        // so with fill_ratio=0.5 every rewrite still lands on an lpn
        // that was actually filled: mapped count must not grow past the
        // filled set.
        let mut m = harness(0.5, 0.25, FillingMode::SeqBoundedRandom);
        let total = m.total_logical_pages();
        m.warm_up(0);
        assert_eq!(m.mapped_lpn_count(), (total as f64 * 0.5) as usize);
    }
}
