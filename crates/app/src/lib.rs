use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framefuse_core::checkpoint::{CheckpointManager, CheckpointStatus};
use framefuse_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, FuseConfig};
use framefuse_core::logging::{self, LogSettings, DEFAULT_LOG_FILTER};
use framefuse_core::window::WindowPlan;

#[derive(Parser)]
#[command(
    name = "framefuse",
    about = "Windowed fusion, checkpointing and temporal blending for long frame sequences"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fusion windows and per-frame coverage for a sequence length.
    Plan(PlanArgs),
    /// Manage `framefuse.toml` in the data directory.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or reset the resume checkpoint of an output directory.
    Checkpoint(CheckpointArgs),
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    total_frames: usize,
    #[arg(long, help = "Defaults to fusion.window_size from the config")]
    window_size: Option<usize>,
    #[arg(long, help = "Defaults to fusion.stride from the config")]
    stride: Option<usize>,
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config unless one exists.
    Init,
    /// Print the effective config as TOML.
    Show,
    /// Validate the config without running anything.
    Check,
}

#[derive(Args)]
struct CheckpointArgs {
    #[command(subcommand)]
    action: CheckpointAction,
    #[arg(long, help = "Defaults to paths.output_dir from the config")]
    output_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CheckpointAction {
    Status,
    /// Remove every checkpoint file so the next run starts from step 0.
    Clear,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Plan(args) => run_plan(args, &resolved_data_dir),
        Commands::Config { action } => run_config(action, &resolved_data_dir),
        Commands::Checkpoint(args) => run_checkpoint(args, &resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let filters = LogSettings::from_env(verbose, cli_log_filter).filters();
    let (file_writer, file_error) = match data_dir.map(logging::open_log_file) {
        Some(Ok(appender)) => (Some(appender), None),
        Some(Err(error)) => (None, Some(error.to_string())),
        None => (None, Some("no data directory".to_string())),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let file_layer = file_writer.map(|appender| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
            .with_filter(parse_env_filter_with_fallback(&filters.file, "file"))
    });

    let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(reason) = file_error {
        warn!(
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> Result<FuseConfig> {
    let cfg_path = config_path(data_dir);
    let config = FuseConfig::load_from_path(&cfg_path)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", cfg_path.display()))?;
    Ok(config)
}

#[derive(Debug, Serialize, PartialEq)]
struct PlanReport {
    total_frames: usize,
    window_size: usize,
    stride: usize,
    windows: Vec<PlanWindow>,
    frames: Vec<FrameCoverage>,
}

#[derive(Debug, Serialize, PartialEq)]
struct PlanWindow {
    start: usize,
    end: usize,
}

#[derive(Debug, Serialize, PartialEq)]
struct FrameCoverage {
    frame: usize,
    windows: usize,
    total_weight: f64,
}

fn build_plan_report(total_frames: usize, window_size: usize, stride: usize) -> Result<PlanReport> {
    let plan = WindowPlan::new(total_frames, window_size, stride)?;
    let mut frames: Vec<FrameCoverage> = (0..total_frames)
        .map(|frame| FrameCoverage {
            frame,
            windows: 0,
            total_weight: 0.0,
        })
        .collect();

    let mut windows = Vec::new();
    for window in &plan {
        for index in window.indices() {
            frames[index].windows += 1;
            frames[index].total_weight += window.weight(index);
        }
        windows.push(PlanWindow {
            start: window.start,
            end: window.end,
        });
    }

    Ok(PlanReport {
        total_frames,
        window_size,
        stride,
        windows,
        frames,
    })
}

fn format_plan(report: &PlanReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} frames, window_size={}, stride={}: {} windows",
        report.total_frames,
        report.window_size,
        report.stride,
        report.windows.len()
    );
    for window in &report.windows {
        let _ = writeln!(out, "  [{}, {})", window.start, window.end);
    }
    for frame in &report.frames {
        let _ = writeln!(
            out,
            "  frame {:>5}: {} window(s), total weight {:.3}",
            frame.frame, frame.windows, frame.total_weight
        );
    }
    out
}

fn run_plan(args: PlanArgs, data_dir: &Path) -> Result<()> {
    let config = match FuseConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            FuseConfig::default()
        }
    };
    let window_size = args.window_size.unwrap_or(config.fusion.window_size);
    let stride = args.stride.unwrap_or(config.fusion.stride);

    let report = build_plan_report(args.total_frames, window_size, stride)?;
    info!(
        total_frames = report.total_frames,
        windows = report.windows.len(),
        "window plan built"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_plan(&report));
    }
    Ok(())
}

fn run_config(action: ConfigAction, data_dir: &Path) -> Result<()> {
    let cfg_path = config_path(data_dir);
    match action {
        ConfigAction::Init => {
            if initialize_data_dir(data_dir)? {
                println!("wrote default config to {}", cfg_path.display());
            } else {
                println!("config already exists at {}", cfg_path.display());
            }
        }
        ConfigAction::Show => {
            let config = FuseConfig::load_from_path(&cfg_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Check => {
            load_config(data_dir)?;
            println!("{} is valid", cfg_path.display());
        }
    }
    Ok(())
}

fn run_checkpoint(args: CheckpointArgs, data_dir: &Path) -> Result<()> {
    let output_dir = match args.output_dir {
        Some(dir) => resolve_relative_to(data_dir, &dir),
        None => load_config(data_dir)?.resolve_paths(data_dir).checkpoint_dir,
    };
    if !output_dir.is_dir() {
        bail!("output directory does not exist: {}", output_dir.display());
    }

    let mut manager = CheckpointManager::new(&output_dir);
    match args.action {
        CheckpointAction::Status => {
            let status = manager.status()?;
            println!("{}: {}", output_dir.display(), format_status(status));
        }
        CheckpointAction::Clear => {
            manager.clear()?;
            println!("{}: checkpoint cleared", output_dir.display());
        }
    }
    Ok(())
}

fn format_status(status: CheckpointStatus) -> String {
    match status {
        CheckpointStatus::NotStarted => "not started".to_string(),
        CheckpointStatus::Running {
            last_completed_step,
        } => format!("running, last completed step {last_completed_step}"),
        CheckpointStatus::Complete => "complete".to_string(),
    }
}
