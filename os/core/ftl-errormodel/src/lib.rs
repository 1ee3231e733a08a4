//! # ErrorModel
//!
//! A polymorphic source of per-page error rates, consulted by `Block`
//! construction to decide which pages to flag unavailable when bad-page
//! salvation is enabled. Modeled as a trait object with room for more
//! tagged variants (`LogNormal` today; `Uniform`/fixed-rate models are
//! an easy follow-on) rather than a process-global singleton, so every
//! instance can carry its own seeded RNG for deterministic replay.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal as LogNormalDist};

/// Common contract for per-page error-rate sources.
pub trait ErrorModel {
    /// The configured raw bit error rate.
    fn ber(&self) -> f64;

    /// Samples a per-page error rate for the next page under
    /// consideration.
    fn per(&mut self) -> f64;

    /// Short, human-readable description (for logs and stats labels).
    fn describe(&self) -> &str;
}

/// Log-normal per-page error model.
///
/// Configured with `(ber, sigma, page_size)`. The page's raw bit error
/// rate induces a page failure probability `mode = 1 - (1 - ber)^(page_size * 8)`;
/// the log-normal's location parameter is derived so that `mode` is the
/// distribution's mode, i.e. `mu = ln(mode) + sigma^2`.
pub struct LogNormal {
    ber: f64,
    sigma: f64,
    dist: LogNormalDist<f64>,
    rng: StdRng,
}

impl LogNormal {
    /// Builds a log-normal error model from raw bit error rate `ber`,
    /// shape parameter `sigma`, and the device `page_size` in bytes.
    ///
    /// # Panics
    /// Panics if `ber` is not in `[0, 1)` or `page_size` is zero; these
    /// are configuration-fatal per the simulator's error taxonomy.
    #[must_use]
    pub fn new(ber: f64, sigma: f64, page_size: usize, seed: u64) -> Self {
        assert!((0.0..1.0).contains(&ber), "ber must be in [0, 1)");
        assert!(page_size > 0, "page_size must be non-zero");
        let mode = 1.0 - (1.0 - ber).powi(i32::try_from(page_size * 8).expect("page_size too large"));
        let mu = mode.ln() + sigma * sigma;
        let dist = LogNormalDist::new(mu, sigma).expect("invalid log-normal parameters");
        Self { ber, sigma, dist, rng: StdRng::seed_from_u64(seed) }
    }

    /// The sigma (shape) parameter this model was constructed with.
    #[must_use]
    pub const fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl ErrorModel for LogNormal {
    fn ber(&self) -> f64 {
        self.ber
    }

    fn per(&mut self) -> f64 {
        self.dist.sample(&mut self.rng)
    }

    fn describe(&self) -> &str {
        "log-normal"
    }
}
