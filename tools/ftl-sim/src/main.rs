//! Host harness: builds an `FtlConfig`, warms up the FTL, replays a
//! synthetic LPN stream against it, and prints the resulting stats
//! snapshot as JSON.

use clap::{Parser, ValueEnum};
use ftl_bitset::Bitset;
use ftl_config::FtlConfig;
use ftl_errormodel::LogNormal;
use ftl_pagemapping::{PageMapping, Request};
use ftl_pal::{FixedLatencyCpu, FixedLatencyDram, FixedLatencyPal, Parameter};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error(transparent)]
    Config(#[from] ftl_config::ConfigError),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkloadPattern {
    Sequential,
    Random,
}

#[derive(Parser)]
#[command(name = "ftl-sim")]
#[command(about = "Replays a synthetic workload against the FTL core and reports the resulting stats")]
struct Cli {
    /// Path to a TOML `FtlConfig` file.
    #[arg(long)]
    config: std::path::PathBuf,

    /// Number of write operations to replay after warm-up.
    #[arg(long, default_value_t = 10_000)]
    ops: u64,

    /// LPN access pattern for the replayed workload.
    #[arg(long, value_enum, default_value_t = WorkloadPattern::Sequential)]
    pattern: WorkloadPattern,

    /// RNG seed for the random workload pattern (ignored for sequential).
    #[arg(long, default_value_t = 42)]
    workload_seed: u64,
}

fn main() -> Result<(), SimError> {
    env_logger::init();
    let cli = Cli::parse();

    let config = FtlConfig::from_file(&cli.config)?;
    log::info!(
        "loaded config: {} physical blocks, {} logical blocks, gc_mode={:?}",
        config.total_physical_blocks,
        config.total_logical_blocks(),
        config.gc.mode
    );

    let mut model = LogNormal::new(config.ber, config.sigma, 4096, config.error_model_seed);
    let pal = FixedLatencyPal { read_latency: 25, write_latency: 200, erase_latency: 1500, info: Parameter::default() };
    let dram = FixedLatencyDram { latency_per_byte: 1 };
    let cpu = FixedLatencyCpu { latency: 1 };
    let mut ftl = PageMapping::init(config.clone(), pal, dram, cpu, &mut model);

    let mut tick = ftl.warm_up(0);
    log::info!("warm-up complete: {} lpns mapped, tick={tick}", ftl.mapped_lpn_count());

    let total_lpns = ftl.total_logical_pages();
    let mut rng = StdRng::seed_from_u64(cli.workload_seed);
    let io_flag = Bitset::new_all_set(config.io_unit_in_page);

    for i in 0..cli.ops {
        let lpn = match cli.pattern {
            WorkloadPattern::Sequential => i % total_lpns.max(1),
            WorkloadPattern::Random => rng.gen_range(0..total_lpns.max(1)),
        };
        let req = Request { lpn, io_flag: io_flag.clone() };
        tick = ftl.write(&req, tick, true);
    }

    log::info!("replay complete: {} ops, final tick={tick}", cli.ops);

    let snapshot = ftl.stats_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot).expect("StatsSnapshot always serializes"));

    Ok(())
}
