//! Command-line front end: inspects, calibrates, groups and re-windows raw
//! acquisition files (`<prefix>.rawE` with its `<prefix>.idxE` step index).
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tofpet_algorithms::{
    CalibrationConfig, CalibrationTable, Calibrator, CrystalGeometry, GroupingConfig,
    NaiveGrouper, PositionMapper, MAX_TIME_WINDOW_PS,
};
use tofpet_core::{NullSink, OverlappedStage, StageConfig, SystemConfig};
use tofpet_io::{
    PhotonWriter, RawReader, RawScanner, RawWriter, RawWriterSink, SinglesWriter, Step,
};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    TofpetIo(#[from] tofpet_io::Error),

    #[error("{0}")]
    Core(#[from] tofpet_core::Error),

    #[error("{0}")]
    Algorithms(#[from] tofpet_algorithms::Error),

    #[error("could not configure the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl CliError {
    /// Process exit code: the OS error number for failures that carry one, 1 otherwise.
    fn exit_code(&self) -> u8 {
        let errno = match self {
            CliError::TofpetIo(e) => e.raw_os_error(),
            CliError::Core(e) => e.raw_os_error(),
            CliError::Algorithms(e) => e.raw_os_error(),
            CliError::ThreadPool(_) => None,
        };
        errno
            .and_then(|code| u8::try_from(code).ok())
            .filter(|&code| code != 0)
            .unwrap_or(1)
    }
}

/// TOFPET/STIC raw data processor.
#[derive(Parser)]
#[command(name = "tofpet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log per-buffer detail
    #[arg(short, long, global = true)]
    verbose: bool,

    /// System configuration (JSON). Defaults to 256 channels at 6.25 ns.
    #[arg(long, global = true)]
    system: Option<PathBuf>,

    /// Worker threads for windowed stages (0 = one per core)
    #[arg(long, global = true, default_value = "0")]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

/// Calibration options shared by `singles` and `process`.
#[derive(Args, Debug)]
struct CalibrationArgs {
    /// Calibration table (JSON), or `none` for uncalibrated bring-up
    calibration: String,

    /// Drop hits with a zero coarse time-over-threshold
    #[arg(long)]
    kill_zero_tot: bool,

    /// Drop hits whose TAC quality metric is out of range instead of flagging them
    #[arg(long)]
    kill_denormal: bool,

    /// Allowed excursion of the time-edge quality metric outside [1, 3]
    #[arg(long, default_value = "0.0")]
    t_tolerance: f32,

    /// Allowed excursion of the energy-edge quality metric outside [1, 3]
    #[arg(long, default_value = "0.0")]
    e_tolerance: f32,
}

impl CalibrationArgs {
    fn config(&self) -> CalibrationConfig {
        CalibrationConfig::default()
            .with_kill_zero_tot(self.kill_zero_tot)
            .with_kill_denormal(self.kill_denormal)
            .with_denormal_tolerance(self.t_tolerance, self.e_tolerance)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the steps and record counts of a raw file
    Info {
        /// Input file prefix
        input: PathBuf,
    },

    /// Calibrate hits and write them as binary singles
    Singles {
        #[command(flatten)]
        calibration: CalibrationArgs,

        /// Input file prefix
        input: PathBuf,

        /// Output singles file
        output: PathBuf,
    },

    /// Calibrate, position and group hits into photons
    Process {
        #[command(flatten)]
        calibration: CalibrationArgs,

        /// Input file prefix
        input: PathBuf,

        /// Output file (`.csv` for text, anything else for binary)
        output: PathBuf,

        /// Crystal geometry (JSON). Defaults to 8x8 blocks of 3.1 mm crystals.
        #[arg(long)]
        geometry: Option<PathBuf>,

        /// Grouping radius (mm)
        #[arg(long, default_value = "100.0")]
        radius: f32,

        /// Grouping time window (ns)
        #[arg(long, default_value = "100.0", value_parser = parse_window_ns)]
        window_ns: f64,

        /// Largest cluster kept
        #[arg(long, default_value = "16")]
        max_hits: usize,
    },

    /// Copy a raw file, keeping each hit inside its buffer window
    Rewindow {
        /// Input file prefix
        input: PathBuf,

        /// Output file prefix
        output: PathBuf,
    },
}

/// Accepts a finite, non-negative window that fits the grouper's range.
fn parse_window_ns(value: &str) -> std::result::Result<f64, String> {
    let window: f64 = value
        .parse()
        .map_err(|e| format!("`{value}` is not a number: {e}"))?;
    let max_ns = MAX_TIME_WINDOW_PS as f64 / 1000.0;
    if !window.is_finite() || window < 0.0 {
        return Err(format!("window must be a finite, non-negative time, got {value}"));
    }
    if window > max_ns {
        return Err(format!("window must not exceed {max_ns} ns, got {value}"));
    }
    Ok(window)
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    if let Err(e) = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("logging disabled: {e}");
    }
}

fn load_system(path: Option<&Path>) -> Result<SystemConfig> {
    let config = match path {
        Some(path) => {
            log::info!("loading system configuration from {}", path.display());
            SystemConfig::from_file(path)?
        }
        None => SystemConfig::default(),
    };
    Ok(config)
}

fn log_step(index: usize, total: usize, step: &Step) {
    log::info!(
        "step {:3} of {:3}: {} {} (bytes {} to {})",
        index + 1,
        total,
        step.param1,
        step.param2,
        step.begin,
        step.end
    );
}

fn info(input: &Path, system: SystemConfig) -> Result<()> {
    let scanner = RawScanner::open(input)?;
    let reader = RawReader::open(input, system)?;

    println!("File: {}", tofpet_io::raw_path(input).display());
    println!(
        "Size: {} bytes ({:.2} MB)",
        reader.file_size(),
        reader.file_size() as f64 / 1_000_000.0
    );
    match reader.start_time()? {
        Some(time) => println!("Acquisition start: {}", time),
        None => println!("Acquisition start: missing"),
    }
    println!("Steps: {}", scanner.n_steps());
    for (i, step) in scanner.steps().iter().enumerate() {
        println!(
            "  {:3}: {} {} ({} bytes)",
            i,
            step.param1,
            step.param2,
            step.byte_len()
        );
    }

    let stats = reader.read_all(&mut NullSink)?;
    println!("Frames: {}", stats.decoder.frame_headers);
    println!("TOFPET hits: {}", stats.decoder.tofpet_hits);
    println!("STIC hits: {}", stats.decoder.stic_hits);
    println!("Discarded (channel): {}", stats.decoder.discarded_channel);
    if let Some((code, offset)) = stats.malformed {
        println!("Malformed record type {} at byte {}", code, offset);
    }
    Ok(())
}

fn singles(
    args: &CalibrationArgs,
    input: &Path,
    output: &Path,
    system: SystemConfig,
) -> Result<()> {
    let scanner = RawScanner::open(input)?;
    let reader = RawReader::open(input, system.clone())?;
    let table = Arc::new(CalibrationTable::load(&args.calibration, system.n_channels)?);
    let mut writer = SinglesWriter::create(output, 0.0, 0.0)?;

    for (i, step) in scanner.steps().iter().enumerate() {
        log_step(i, scanner.n_steps(), step);
        writer.set_step(step.param1, step.param2);
        let calibrator = Calibrator::new(Arc::clone(&table), args.config(), &system);
        let chain = OverlappedStage::new(calibrator, StageConfig::per_record(), writer)?;
        let (_, chain) = reader.spawn_step(step, chain)?.wait()?;
        writer = chain.into_sink();
    }
    log::info!("{} singles written to {}", writer.written(), output.display());
    Ok(())
}

struct GroupingArgs<'a> {
    geometry: Option<&'a Path>,
    grouping: GroupingConfig,
    parallelism: usize,
}

fn process(
    args: &CalibrationArgs,
    grouping: &GroupingArgs<'_>,
    input: &Path,
    output: &Path,
    system: SystemConfig,
) -> Result<()> {
    let scanner = RawScanner::open(input)?;
    let reader = RawReader::open(input, system.clone())?;
    let table = Arc::new(CalibrationTable::load(&args.calibration, system.n_channels)?);
    let geometry = match grouping.geometry {
        Some(path) => CrystalGeometry::from_file(path)?,
        None => CrystalGeometry::default(),
    };
    grouping.grouping.validate()?;
    let mut writer = PhotonWriter::create(output, 0.0, 0.0)?;

    for (i, step) in scanner.steps().iter().enumerate() {
        log_step(i, scanner.n_steps(), step);
        writer.set_step(step.param1, step.param2);

        let grouper = NaiveGrouper::new(grouping.grouping)?;
        let group_stage = grouping
            .grouping
            .stage_config()
            .with_parallelism(grouping.parallelism);
        let chain = OverlappedStage::new(
            Calibrator::new(Arc::clone(&table), args.config(), &system),
            StageConfig::per_record(),
            OverlappedStage::new(
                PositionMapper::new(&geometry, system.n_channels)?,
                StageConfig::per_record(),
                OverlappedStage::new(grouper, group_stage, writer)?,
            )?,
        )?;

        let (_, chain) = reader.spawn_step(step, chain)?.wait()?;
        writer = chain.into_sink().into_sink().into_sink();
    }
    log::info!("{} photons written to {}", writer.written(), output.display());
    Ok(())
}

fn rewindow(input: &Path, output: &Path, system: SystemConfig) -> Result<()> {
    let scanner = RawScanner::open(input)?;
    let reader = RawReader::open(input, system.clone())?;
    let start = reader.start_time()?.unwrap_or(0);

    let mut sink: Option<RawWriterSink> = None;
    for (i, step) in scanner.steps().iter().enumerate() {
        log_step(i, scanner.n_steps(), step);
        let next = match sink.take() {
            Some(mut s) => {
                s.open_step(step.param1, step.param2)?;
                s
            }
            None => RawWriterSink::new(
                RawWriter::create(output, start, &system)?,
                step.param1,
                step.param2,
            )?,
        };
        let (_, back) = reader.spawn_step(step, next)?.wait()?;
        sink = Some(back);
    }

    match sink {
        Some(sink) => {
            log::info!("{} hits rewritten", sink.written());
            sink.into_inner().finish()?;
        }
        None => {
            // No steps: still leave an empty, valid file pair behind.
            RawWriter::create(output, start, &system)?.finish()?;
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()?;
    }
    let system = load_system(cli.system.as_deref())?;
    let start = Instant::now();

    match cli.command {
        Commands::Info { input } => info(&input, system)?,
        Commands::Singles {
            calibration,
            input,
            output,
        } => singles(&calibration, &input, &output, system)?,
        Commands::Process {
            calibration,
            input,
            output,
            geometry,
            radius,
            window_ns,
            max_hits,
        } => {
            #[allow(clippy::cast_possible_truncation)]
            let window_ps = (window_ns * 1000.0).round() as i64;
            let grouping = GroupingArgs {
                geometry: geometry.as_deref(),
                grouping: GroupingConfig::default()
                    .with_radius_mm(radius)
                    .with_time_window_ps(window_ps)
                    .with_max_hits(max_hits),
                parallelism: rayon::current_num_threads(),
            };
            process(&calibration, &grouping, &input, &output, system)?;
        }
        Commands::Rewindow { input, output } => rewindow(&input, &output, system)?,
    }

    log::info!("done in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
