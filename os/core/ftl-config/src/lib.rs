//! # FTL configuration
//!
//! Everything `ftl-pagemapping` needs to construct an FTL instance,
//! plus a TOML loader covering the configuration keys named in the
//! upstream configuration-key list. Validation runs eagerly at load
//! time so configuration-fatal conditions surface before the
//! simulator starts rather than mid-run.

use ftl_salvation::SalvationConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("over-provision ratio {0} leaves no room for user data (must be in (0,1))")]
    OverprovisionOutOfRange(f64),
    #[error("hot/cold capacity ratio {0} out of range (0,1]")]
    CapacityRatioOutOfRange(f64),
    #[error("unavailable page threshold {0} out of range [0,1]")]
    UnavailableThresholdOutOfRange(f64),
    #[error("gc reclaim threshold ratio {0} out of range (0,1)")]
    ThresholdRatioOutOfRange(f64),
    #[error("d-choice parameter must be >= 1, got {0}")]
    DChoiceParamTooSmall(usize),
    #[error("geometry field {field} must be positive")]
    GeometryNotPositive { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    Fixed,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictPolicy {
    Greedy,
    CostBenefit,
    Random,
    DChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillingMode {
    /// Sequential fill, sequential invalidation.
    SeqSeq,
    /// Sequential fill, bounded-random invalidation.
    SeqBoundedRandom,
    /// Random fill, unbounded-random invalidation.
    RandomUnbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HotColdConfig {
    pub enabled: bool,
    pub capacity_ratio: f64,
}

impl HotColdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && !(0.0..=1.0).contains(&self.capacity_ratio) {
            return Err(ConfigError::CapacityRatioOutOfRange(self.capacity_ratio));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GcConfig {
    pub mode: GcMode,
    pub evict_policy: EvictPolicy,
    pub d_choice_param: usize,
    pub reclaim_block: usize,
    pub reclaim_threshold: usize,
    pub threshold_ratio: f64,
}

impl GcConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.evict_policy == EvictPolicy::DChoice && self.d_choice_param < 1 {
            return Err(ConfigError::DChoiceParamTooSmall(self.d_choice_param));
        }
        if self.mode == GcMode::Threshold && !(0.0..1.0).contains(&self.threshold_ratio) {
            return Err(ConfigError::ThresholdRatioOutOfRange(self.threshold_ratio));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillingConfig {
    pub fill_ratio: f64,
    pub invalid_page_ratio: f64,
    pub mode: FillingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FtlConfig {
    pub total_physical_blocks: u32,
    pub pages_in_block: u32,
    pub io_unit_in_page: usize,
    pub page_count_to_max_perf: usize,
    pub overprovision_ratio: f64,
    pub use_random_io_tweak: bool,
    pub ber: f64,
    pub sigma: f64,
    pub hot_cold: HotColdConfig,
    pub gc: GcConfig,
    pub salvation: SalvationConfig,
    pub filling: FillingConfig,
    pub salvation_seed: u64,
    pub error_model_seed: u64,
    pub gc_seed: u64,
}

impl FtlConfig {
    /// Total logical blocks after over-provisioning, rounding down.
    #[must_use]
    pub fn total_logical_blocks(&self) -> u32 {
        (f64::from(self.total_physical_blocks) * (1.0 - self.overprovision_ratio)) as u32
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.total_physical_blocks == 0 {
            return Err(ConfigError::GeometryNotPositive { field: "total_physical_blocks" });
        }
        if self.pages_in_block == 0 {
            return Err(ConfigError::GeometryNotPositive { field: "pages_in_block" });
        }
        if self.io_unit_in_page == 0 {
            return Err(ConfigError::GeometryNotPositive { field: "io_unit_in_page" });
        }
        if self.page_count_to_max_perf == 0 {
            return Err(ConfigError::GeometryNotPositive { field: "page_count_to_max_perf" });
        }
        if !(0.0..1.0).contains(&self.overprovision_ratio) || self.total_logical_blocks() == 0 {
            return Err(ConfigError::OverprovisionOutOfRange(self.overprovision_ratio));
        }
        if self.salvation.enabled && !(0.0..=1.0).contains(&self.salvation.unavailable_page_threshold) {
            return Err(ConfigError::UnavailableThresholdOutOfRange(self.salvation.unavailable_page_threshold));
        }
        self.hot_cold.validate()?;
        self.gc.validate()?;
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = fs::read_to_string(path_ref)
            .map_err(|source| ConfigError::Read { path: path_ref.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }
}
