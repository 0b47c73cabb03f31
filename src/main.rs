use std::path::PathBuf;
use std::process::ExitCode;

use beaconvec::config::{check_input, check_output_dir};
use beaconvec::{Config, JsonReport, MalformedPolicy, Pipeline, ReadingSource, ResourceProfile, Result, RunSummary};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Aggregates beacon/antenna signal readings into one fixed-width vector per
/// beacon and timestamp.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON file holding the readings.
    input: PathBuf,

    /// Existing directory the report is written to.
    #[clap(short, long = "output-directory", default_value = ".")]
    output_dir: PathBuf,

    /// Debug logging (RUST_LOG takes precedence).
    #[clap(short, long)]
    verbose: bool,

    /// JSON configuration file; flags below override its values.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Antenna ids in vector order, comma separated.
    #[clap(long, value_delimiter = ',')]
    antennas: Option<Vec<i64>>,

    /// Level for antennas without a reading.
    #[clap(long, allow_negative_numbers = true)]
    default_level: Option<f64>,

    /// In-memory aggregation state before spilling to disk, in MiB.
    #[clap(long, conflicts_with = "unbounded")]
    memory_budget_mb: Option<usize>,

    /// Keep all aggregation state in memory.
    #[clap(long)]
    unbounded: bool,

    #[clap(long)]
    spill_dir: Option<PathBuf>,

    /// Ingestion shards (default: detected from available cores).
    #[clap(long)]
    workers: Option<usize>,

    #[clap(long, value_enum)]
    on_malformed: Option<MalformedPolicy>,

    #[clap(long)]
    report_name: Option<String>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(antennas) = &self.antennas {
            config.antennas = antennas.clone();
        }
        if let Some(level) = self.default_level {
            config.default_level = level;
        }
        if let Some(mb) = self.memory_budget_mb {
            config.memory_budget = Some(mb.saturating_mul(1024 * 1024));
        }
        if self.unbounded {
            config.memory_budget = None;
        }
        if let Some(dir) = &self.spill_dir {
            config.spill_dir = Some(dir.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        if let Some(policy) = self.on_malformed {
            config.on_malformed = policy;
        }
        if let Some(name) = &self.report_name {
            config.report_name = name.clone();
        }
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let profile = ResourceProfile::detect().with_config(&config);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.runtime_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(args, config, profile)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "aggregation failed");
            ExitCode::FAILURE
        }
    }
}

async fn async_main(args: Args, mut config: Config, profile: ResourceProfile) -> Result<RunSummary> {
    let input = check_input(&args.input)?;
    let output_dir = check_output_dir(&args.output_dir)?;

    config.workers = Some(profile.workers);
    let pipeline = Pipeline::new(config)?;
    info!(
        input = %input.display(),
        output = %output_dir.display(),
        antennas = ?pipeline.antennas().ids(),
        workers = profile.workers,
        "starting aggregation"
    );

    let source = ReadingSource::open(&input)?;
    let report = JsonReport::create(&output_dir, &pipeline.config().report_name)?;
    let (summary, _) = pipeline.run(source, report).await?;
    Ok(summary)
}
