//! `ecu-harness` command line.
//!
//! Each subcommand runs its stage plus every prerequisite stage, in order,
//! under an exclusive workspace lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ecu_harness::config::HarnessConfig;
use ecu_harness::error::{HarnessError, INTERNAL_FAILURE_EXIT_CODE};
use ecu_harness::lock::WorkspaceLock;
use ecu_harness::pipeline::{plan, Pipeline, Stage, StageFailure};
use ecu_harness::preflight;
use ecu_harness::process::HostRunner;
use ecu_harness::record::{RunId, RunRecord};
use ecu_harness::telemetry::{init_tracing, level_for};

#[derive(Parser)]
#[command(name = "ecu-harness")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, run and capture RISC-V ECU firmware under Renode", long_about = None)]
struct Cli {
    /// Workspace root (default: current directory)
    #[arg(long, global = true, env = "ECU_HARNESS_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Configuration file (default: <workspace>/ecu-harness.toml, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Clone the firmware libraries that are not checked out yet
    FetchDependencies,
    /// Build the emulator base image from its upstream sources
    BuildBaseImage,
    /// Build the project image on top of the base image
    BuildImage,
    /// Cross-compile the firmware inside the project image
    BuildFirmware,
    /// Bring up the CAN link, capture traffic and run the emulator
    Run,
    /// Remove the firmware, capture log and fetched checkouts
    Clean,
}

impl Commands {
    fn stage(self) -> Stage {
        match self {
            Commands::FetchDependencies => Stage::FetchDependencies,
            Commands::BuildBaseImage => Stage::BuildBaseImage,
            Commands::BuildImage => Stage::BuildImage,
            Commands::BuildFirmware => Stage::BuildFirmware,
            Commands::Run => Stage::Run,
            Commands::Clean => Stage::Clean,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    match run(&cli) {
        Ok(code) => exit_code(code),
        Err(err) => {
            print_banner(&err);
            exit_code(failure_exit_code(&err))
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let workspace = resolve_workspace(cli.workspace.as_deref())?;
    let config = HarnessConfig::load(&workspace, cli.config.as_deref())?;
    let _lock = WorkspaceLock::acquire(&config.state_dir())?;

    let target = cli.command.stage();
    preflight::check_stages(&plan(target), &config)?;

    let run_id = RunId::generate()?;
    info!(run_id = %run_id, workspace = %workspace.display(), stage = target.name(), "starting");

    let runner = HostRunner;
    let pipeline = Pipeline::new(&config, &runner).with_session_name(run_id.session_name());

    let mut record = match target {
        Stage::Run => {
            let record = RunRecord::start(&run_id, &config.runtime.capture_log)?;
            record.write(&config.state_dir())?;
            Some(record)
        }
        _ => None,
    };

    // Locked per write: the capture echo thread prints to stdout too.
    let mut out = std::io::stdout();
    let outcome = pipeline.execute(target, &mut out);
    out.flush().ok();

    if let Some(record) = record.as_mut() {
        let emulator_exit = outcome
            .as_ref()
            .ok()
            .and_then(|result| result.as_ref())
            .map(|result| result.exit_code);
        record.finish(emulator_exit)?;
        if let Err(e) = record.write(&config.state_dir()) {
            warn!("failed to record run: {e:#}");
        }
    }

    match outcome? {
        Some(result) => {
            if let Some(failure) = result.failure() {
                warn!("{failure}");
            }
            Ok(result.exit_code)
        }
        None => Ok(0),
    }
}

fn resolve_workspace(explicit: Option<&Path>) -> Result<PathBuf> {
    let raw = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    raw.canonicalize()
        .with_context(|| format!("resolving workspace '{}'", raw.display()))
}

fn failure_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(failure) = err.downcast_ref::<StageFailure>() {
        return failure.exit_code();
    }
    if let Some(harness) = err.downcast_ref::<HarnessError>() {
        return harness.exit_code();
    }
    INTERNAL_FAILURE_EXIT_CODE
}

fn print_banner(err: &anyhow::Error) {
    let headline = match err.downcast_ref::<StageFailure>() {
        Some(failure) => format!("ecu-harness: stage '{}' FAILED", failure.stage),
        None => "ecu-harness: FAILED".to_string(),
    };
    eprintln!();
    eprintln!("{}", "=".repeat(headline.len()));
    eprintln!("{headline}");
    eprintln!("{}", "=".repeat(headline.len()));
    for (depth, cause) in err.chain().enumerate() {
        let prefix = if depth == 0 { "error" } else { "caused by" };
        eprintln!("  {prefix}: {cause}");
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(INTERNAL_FAILURE_EXIT_CODE as u8))
}
