//! Command line front end of the SPIM deconvolution.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use spim_deconvolution::config::{
    DeconvolutionSettings, RunConfig, SpimConfiguration, UpdateMode,
};
use spim_deconvolution::pipeline::{self, RunHandles};
use spim_deconvolution::SpimError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spim-deconvolution")]
#[command(about = "Multi-view Lucy-Richardson deconvolution of registered SPIM acquisitions")]
#[command(version)]
struct Cli {
    /// Log specification, e.g. `info` or `debug, rayon=warn`. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Additionally write log files into this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct every timepoint and channel of an acquisition.
    Run {
        /// Run configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },

    /// Extract and save the PSFs of an acquisition without deconvolving.
    ExtractPsf {
        /// Run configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },

    /// Deconvolve volumes that already share one frame.
    Deconvolve(DeconvolveArgs),

    /// Print a run configuration holding the current defaults.
    Defaults,
}

#[derive(Args)]
struct DeconvolveArgs {
    /// One `.npy` volume per view.
    #[arg(long, required = true, num_args = 1..)]
    image: Vec<PathBuf>,

    /// One PSF for all views or one per view.
    #[arg(long, required = true, num_args = 1..)]
    psf: Vec<PathBuf>,

    /// Optional weight volume per view.
    #[arg(long, num_args = 1..)]
    weight: Vec<PathBuf>,

    /// Output `.npy` file.
    #[arg(long)]
    output: PathBuf,

    #[arg(long)]
    iterations: Option<usize>,

    /// Tikhonov regularization, 0 disables it.
    #[arg(long)]
    lambda: Option<f64>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Worker threads, 0 uses every core.
    #[arg(long)]
    threads: Option<usize>,

    /// Write the estimate every n iterations.
    #[arg(long)]
    debug_interval: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Multiplicative,
    Additive,
}

impl From<ModeArg> for UpdateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Multiplicative => UpdateMode::Multiplicative,
            ModeArg::Additive => UpdateMode::Additive,
        }
    }
}

fn setup_logging(spec: &str, log_dir: Option<&Path>) -> anyhow::Result<LoggerHandle> {
    let logger = Logger::try_with_env_or_str(spec)?;
    let logger = match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir))
            .duplicate_to_stderr(Duplicate::All),
        None => logger.log_to_stderr(),
    };
    Ok(logger.start()?)
}

/// Reads a run configuration. A missing `deconvolution` section is taken from the settings
/// stored by the last successful run.
fn load_run_config(path: &Path) -> anyhow::Result<RunConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration {path:?}"))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{path:?} is not valid JSON"))?;
    let has_settings = value.get("deconvolution").is_some();
    let mut config: RunConfig = serde_json::from_value(value)
        .with_context(|| format!("{path:?} is not a run configuration"))?;
    if !has_settings {
        log::info!("no deconvolution settings in {path:?}, using those of the last run");
        config.deconvolution = DeconvolutionSettings::load_preferences();
    }
    Ok(config)
}

fn config_error(err: anyhow::Error) -> SpimError {
    SpimError::Config(format!("{err:#}"))
}

/// Runs `job` on a worker thread and reports its progress until it is done.
fn run_in_background<T, F>(handles: &RunHandles, job: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(RunHandles) -> Result<T, SpimError> + Send + 'static,
{
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let worker_handles = handles.clone();
    thread::spawn(move || {
        if result_tx.send(job(worker_handles)).is_err() {
            log::error!("result of the worker thread could not be delivered");
        }
    });

    loop {
        match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => return Ok(result?),
            Err(RecvTimeoutError::Timeout) => {
                if let (Ok(progress), Ok(stage)) =
                    (handles.progress_lock.read(), handles.stage_lock.read())
                {
                    if let Some(progress) = *progress {
                        log::info!("{stage}: {:.0} %", progress * 100.0);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("worker thread stopped without a result")
            }
        }
    }
}

fn execute(command: Commands) -> anyhow::Result<()> {
    let handles = RunHandles::default();
    match command {
        Commands::Run { config } => {
            let config = load_run_config(&config).map_err(config_error)?;
            let settings = config.deconvolution.clone();
            let summaries = run_in_background(&handles, move |handles| {
                pipeline::run(&config, &handles)
            })?;
            for summary in &summaries {
                log::info!(
                    "timepoint {} channel {}: {:?}",
                    summary.timepoint,
                    summary.channel,
                    summary.output
                );
            }
            settings.store_preferences();
        }
        Commands::ExtractPsf { config } => {
            let config = load_run_config(&config).map_err(config_error)?;
            let written = run_in_background(&handles, move |handles| {
                pipeline::extract_psfs(&config, &handles)
            })?;
            for path in written {
                log::info!("wrote {path:?}");
            }
        }
        Commands::Deconvolve(args) => {
            let mut settings = DeconvolutionSettings::load_preferences();
            if let Some(iterations) = args.iterations {
                settings.max_iterations = iterations;
                settings.min_iterations = settings.min_iterations.min(iterations);
            }
            if let Some(lambda) = args.lambda {
                settings.lambda = lambda;
            }
            if let Some(mode) = args.mode {
                settings.update_mode = mode.into();
            }
            if let Some(threads) = args.threads {
                settings.threads = threads;
            }
            if args.debug_interval.is_some() {
                settings.debug_interval = args.debug_interval;
            }
            let job_settings = settings.clone();
            let result = run_in_background(&handles, move |handles| {
                pipeline::deconvolve_files(
                    &args.image,
                    &args.psf,
                    &args.weight,
                    &args.output,
                    &job_settings,
                    &handles,
                )
            })?;
            log::info!("finished after {} iterations", result.stats.len());
            settings.store_preferences();
        }
        Commands::Defaults => {
            let config = RunConfig {
                acquisition: SpimConfiguration::default(),
                deconvolution: DeconvolutionSettings::load_preferences(),
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logger = match setup_logging(&cli.log_level, cli.log_dir.as_deref()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("cannot start logger: {err:#}");
            None
        }
    };

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            let code = err.downcast_ref::<SpimError>().map_or(1, SpimError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
