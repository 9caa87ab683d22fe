//! chronofit CLI: training and sweep drivers.
//!
//! `chronofit train` runs the train + test pipeline `itr` times;
//! `chronofit sweep` samples configurations from a search space and runs one
//! pipeline per sample.

use anyhow::Context;
use chronofit_ml::runtime::apply_process_env;
use chronofit_ml::training::sweep::DEFAULT_TRIAL_COUNT;
use chronofit_ml::{ExperimentConfig, ExperimentRunner, SweepController, SweepSpace};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// chronofit: training drivers for time-series forecasting and diffusion models
#[derive(Parser, Debug)]
#[command(name = "chronofit", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train and test one configuration
    Train(TrainArgs),
    /// Run a hyperparameter sweep
    Sweep(SweepArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// TOML file with experiment fields (overridden by env and flags)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    experiment: ExperimentConfig,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// TOML file with experiment fields (overridden by env and flags)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Search space as YAML or JSON (defaults to the built-in space)
    #[arg(long)]
    sweep_config: Option<PathBuf>,

    /// Number of trials
    #[arg(long, default_value_t = DEFAULT_TRIAL_COUNT)]
    count: usize,

    /// Seed for sampling trial configurations
    #[arg(long, default_value_t = 0)]
    sweep_seed: u64,

    #[command(flatten)]
    experiment: ExperimentConfig,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();
    // SAFETY: no thread has been spawned yet; the log writer thread starts
    // only after this call.
    unsafe { apply_process_env() };

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let sub = matches
        .subcommand()
        .map(|(_, sub)| sub)
        .context("a subcommand is required")?;

    match cli.command {
        Commands::Train(args) => {
            let config = resolve(&args.experiment, args.config.as_deref(), sub)?;
            let _guard = init_tracing(cli.verbose, cli.quiet, &config.log_dir);
            train(&config)
        }
        Commands::Sweep(args) => {
            let config = resolve(&args.experiment, args.config.as_deref(), sub)?;
            let space = match &args.sweep_config {
                Some(path) => SweepSpace::load(path)
                    .with_context(|| format!("Invalid sweep config {}", path.display()))?,
                None => SweepSpace::default(),
            };
            let _guard = init_tracing(cli.verbose, cli.quiet, &config.log_dir);
            sweep(config, space, args.count, args.sweep_seed)
        }
    }
}

fn resolve(
    parsed: &ExperimentConfig,
    file: Option<&Path>,
    matches: &ArgMatches,
) -> anyhow::Result<ExperimentConfig> {
    ExperimentConfig::resolve(parsed, file, matches).context("Configuration error")
}

/// Human-readable stderr layer plus daily-rolled JSON files under
/// `<log_dir>/logs`.
fn init_tracing(verbose: u8, quiet: bool, log_dir: &Path) -> WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = log_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chronofit.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn train(config: &ExperimentConfig) -> anyhow::Result<()> {
    let reports = ExperimentRunner::new()
        .run_all(config)
        .context("Training run failed")?;
    for report in &reports {
        println!(
            "{}: {} epochs{}, test_loss {:.6}, best checkpoint {}",
            report.identity.name,
            report.epochs_run,
            if report.stopped_early { " (stopped early)" } else { "" },
            report.test_loss().unwrap_or(f64::NAN),
            report.best_checkpoint.as_deref().unwrap_or("none"),
        );
        if !report.checkpoint_failures.is_empty() {
            println!(
                "  {} checkpoint write(s) failed; see the log for details",
                report.checkpoint_failures.len()
            );
        }
    }
    Ok(())
}

fn sweep(
    config: ExperimentConfig,
    space: SweepSpace,
    count: usize,
    sweep_seed: u64,
) -> anyhow::Result<()> {
    let log_dir = config.log_dir.clone();
    let mut controller =
        SweepController::new(config, space, count, sweep_seed).context("Configuration error")?;
    let report = controller.run(&ExperimentRunner::new());
    let path = report
        .save(&log_dir)
        .context("Failed to write sweep report")?;
    tracing::info!(sweep_id = %report.id, path = %path.display(), "Sweep report saved");

    println!(
        "Sweep {}: {} trials, {} failed; report at {}",
        report.id,
        report.trials.len(),
        report.failed(),
        path.display()
    );
    if let Some(best) = report.best() {
        println!(
            "  best trial #{} {} = {:.6} with {}",
            best.trial_number,
            report.metric.name,
            best.metric.unwrap_or(f64::NAN),
            serde_json::to_string(&best.params)?
        );
    }
    if report.failed() == report.trials.len() {
        anyhow::bail!("all {} sweep trials failed", report.trials.len());
    }
    Ok(())
}
