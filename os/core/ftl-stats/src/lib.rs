//! # Stats
//!
//! Counters the page-mapping layer updates as it runs, plus a
//! JSON-serializable snapshot for whatever glue wires this into a
//! real metrics backend (out of scope here; see the crate-level
//! docs of `ftl-pagemapping`).

use serde::Serialize;

/// Running counters, named after the `ftl.page_mapping.*` statistics.
#[derive(Debug, Default, Clone)]
pub struct FtlStats {
    gc_count: u64,
    gc_reclaimed_blocks: u64,
    gc_superpage_copies: u64,
    gc_page_copies: u64,
    valid_pages_at_reclaim_sum: u64,
    valid_pages_at_reclaim_samples: u64,
}

impl FtlStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gc_cycle(&mut self) {
        self.gc_count += 1;
    }

    /// Records one block reclaimed by GC, with the valid super-page
    /// count it held just before reclaim (for the `valid_pages`
    /// average).
    pub fn record_reclaimed_block(&mut self, valid_superpages_at_reclaim: u32) {
        self.gc_reclaimed_blocks += 1;
        self.valid_pages_at_reclaim_sum += u64::from(valid_superpages_at_reclaim);
        self.valid_pages_at_reclaim_samples += 1;
    }

    pub fn record_superpage_copy(&mut self) {
        self.gc_superpage_copies += 1;
    }

    pub fn record_page_copy(&mut self) {
        self.gc_page_copies += 1;
    }

    #[must_use]
    pub fn gc_count(&self) -> u64 {
        self.gc_count
    }

    /// Renders a point-in-time snapshot. `wear_leveling` is computed
    /// by the caller over the live block population (this crate has
    /// no view of block state) via [`wear_leveling`]; `hot`/
    /// `hot_capacity` are likewise read live from the hot-address
    /// tracker by the caller rather than tracked here.
    #[must_use]
    pub fn snapshot(&self, wear_leveling: f64, hot: u64, hot_capacity: u64) -> StatsSnapshot {
        let valid_pages = if self.valid_pages_at_reclaim_samples == 0 {
            0.0
        } else {
            self.valid_pages_at_reclaim_sum as f64 / self.valid_pages_at_reclaim_samples as f64
        };
        StatsSnapshot {
            gc_count: self.gc_count,
            gc_reclaimed_blocks: self.gc_reclaimed_blocks,
            gc_superpage_copies: self.gc_superpage_copies,
            gc_page_copies: self.gc_page_copies,
            wear_leveling,
            valid_pages,
            hot,
            hot_capacity,
        }
    }
}

/// `E^2 / (N * Q)` over `erase_counts`, or `-1.0` if every erase count
/// is zero (no wear yet to report on).
#[must_use]
pub fn wear_leveling(erase_counts: impl IntoIterator<Item = u32>, total_logical_blocks: u64) -> f64 {
    let (e, q) = erase_counts
        .into_iter()
        .fold((0u128, 0u128), |(e, q), c| (e + u128::from(c), q + u128::from(c) * u128::from(c)));
    if q == 0 {
        return -1.0;
    }
    (e as f64) * (e as f64) / (total_logical_blocks as f64 * q as f64)
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub gc_count: u64,
    pub gc_reclaimed_blocks: u64,
    pub gc_superpage_copies: u64,
    pub gc_page_copies: u64,
    pub wear_leveling: f64,
    pub valid_pages: f64,
    pub hot: u64,
    pub hot_capacity: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_with_no_gc_reports_zero_valid_pages() {
        let stats = FtlStats::new();
        let snap = stats.snapshot(-1.0, 0, 0);
        assert_eq!(snap.gc_count, 0);
        assert!((snap.valid_pages - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reclaimed_block_average_tracks_samples() {
        let mut stats = FtlStats::new();
        stats.record_gc_cycle();
        stats.record_reclaimed_block(4);
        stats.record_reclaimed_block(2);
        let snap = stats.snapshot(0.5, 3, 10);
        assert_eq!(snap.gc_reclaimed_blocks, 2);
        assert!((snap.valid_pages - 3.0).abs() < f64::EPSILON);
        assert_eq!(snap.hot, 3);
        assert_eq!(snap.hot_capacity, 10);
    }

    #[test]
    fn wear_leveling_is_negative_one_with_no_erases() {
        assert_eq!(wear_leveling([0, 0, 0], 3), -1.0);
    }

    #[test]
    fn wear_leveling_uniform_wear_is_one() {
        // Perfectly even wear: E = 3*5=15, Q=3*25=75, N=3 -> 225/(3*75)=1.0
        assert!((wear_leveling([5, 5, 5], 3) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wear_leveling_uneven_wear_is_below_one() {
        let v = wear_leveling([1, 1, 10], 3);
        assert!(v < 1.0);
    }
}
