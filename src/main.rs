use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use smuscope::config::Config;
use smuscope::correlate::{self, report};
use smuscope::engine::{probe_interesting_sensors, Engine};
use smuscope::eye::SensorSelection;
use smuscope::stimulus::StressTester;
use smuscope::table::PmTableReader;

/// Real-time eye-diagram and core-attribution scope for the AMD Ryzen SMU
/// pm_table.
#[derive(Parser)]
#[command(name = "smuscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample the table and list the sensors that actually move.
    Probe,

    /// Capture eye diagrams triggered on duty-cycled bursts.
    Eye {
        /// Track every sensor instead of probing for moving ones.
        #[arg(short, long)]
        all: bool,

        /// Core to stimulate.
        #[arg(long, default_value_t = 1)]
        victim: i32,

        /// Number of bursts to run.
        #[arg(long, default_value_t = 1)]
        bursts: u32,
    },

    /// Run the per-core stress sweep and write CSV reports.
    Correlate {
        /// Use the on/off phase-mean algorithm instead of the
        /// baseline/active variance sweep.
        #[arg(long)]
        phase_mean: bool,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("smuscope {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if !nix::unistd::Uid::effective().is_root() {
        warn!(
            "running without root: real-time scheduling and memory locking \
             will be best-effort",
        );
    }

    info!(version = version::RELEASE, "starting smuscope");

    match cli.command {
        Command::Probe => run_probe(&cfg),
        Command::Eye {
            all,
            victim,
            bursts,
        } => run_eye(&cfg, all, victim, bursts),
        Command::Correlate { phase_mean } => run_correlate(&cfg, phase_mean),
        Command::Version => unreachable!("handled before logging init"),
    }
}

fn open_reader(cfg: &Config) -> Result<PmTableReader> {
    PmTableReader::open(
        Path::new(&cfg.table.table_path),
        Path::new(&cfg.table.size_path),
    )
    .context("opening pm_table")
}

fn run_probe(cfg: &Config) -> Result<()> {
    let mut reader = open_reader(cfg)?;
    let total = reader.num_sensors();

    let interesting = probe_interesting_sensors(
        &mut reader,
        cfg.sampling.measurement_core,
        cfg.probe.samples,
        cfg.probe.variance_threshold,
    )
    .context("probing sensors")?;

    info!(
        found = interesting.len(),
        total, "changing sensors: {interesting:?}",
    );
    Ok(())
}

fn run_eye(cfg: &Config, all: bool, victim: i32, bursts: u32) -> Result<()> {
    let mut reader = open_reader(cfg)?;
    let total = reader.num_sensors();

    let selection = if all {
        SensorSelection::all(total)
    } else {
        let interesting = probe_interesting_sensors(
            &mut reader,
            cfg.sampling.measurement_core,
            cfg.probe.samples,
            cfg.probe.variance_threshold,
        )
        .context("probing sensors")?;
        info!(found = interesting.len(), total, "tracking changing sensors");
        SensorSelection::new(interesting)
    };

    if selection.is_empty() {
        bail!("no sensors selected; try --all");
    }

    let engine = Engine::start(cfg, reader, selection.clone()).context("starting engine")?;

    for burst in 0..bursts {
        info!(burst, victim, "running stimulus burst");
        engine.run_burst_blocking(victim)?;
    }

    // Let the last capture window elapse and finalize.
    thread::sleep(Duration::from_millis(
        u64::from(cfg.eye.window_after_ms) + 100,
    ));

    for (storage_idx, &original) in selection.original_indices().iter().enumerate() {
        if let Some(snap) = engine.display().read(storage_idx) {
            info!(
                sensor = original,
                bins = snap.x_ms.len(),
                accumulations = snap.accumulation_count,
                "eye snapshot",
            );
        }
    }

    engine.shutdown();
    Ok(())
}

fn run_correlate(cfg: &Config, phase_mean: bool) -> Result<()> {
    let reader = open_reader(cfg)?;
    let total = reader.num_sensors();

    let engine = Engine::start(cfg, reader, SensorSelection::all(total))
        .context("starting engine")?;

    let num_cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut tester = StressTester::new(num_cores);
    tester.start();

    if phase_mean {
        // Let the square waves and the history window fill first.
        thread::sleep(cfg.correlation.baseline + cfg.correlation.active);
        correlate::phase_mean_correlation(&tester, engine.stats());
    } else {
        correlate::run_sweep(
            &tester,
            engine.stats(),
            &engine.shared().terminate,
            &cfg.sweep_config(),
        );
    }

    let cells = engine.stats().snapshot();
    let (table_path, summary_path) = report::write_reports(
        Path::new(&cfg.correlation.report_dir),
        &cfg.correlation.report_prefix,
        &cells,
        None,
    )
    .context("writing correlation reports")?;

    info!(
        table = %table_path.display(),
        summary = %summary_path.display(),
        "correlation run complete",
    );

    tester.stop();
    engine.shutdown();
    Ok(())
}
