mod output;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Instrument, info_span};
use tracing_subscriber::EnvFilter;

use ybd_lib::config::Config;
use ybd_lib::run::{Target, run};

use crate::output::{OutputFormat, print_error, print_outcome};
use crate::supervisor::Workers;

/// ybd - build Baserock definitions into cached artifacts
#[derive(Parser)]
#[command(name = "ybd")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Definition file to build (system, stratum, chunk or cluster)
  definition: PathBuf,

  /// Target architecture, e.g. x86_64 or armv8l64
  arch: String,

  /// Enable debug logging (overridden by RUST_LOG)
  #[arg(short, long)]
  verbose: bool,

  /// Output format for keys, build order and the summary
  #[arg(short, long, value_enum, default_value_t)]
  output: OutputFormat,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  match cmd_build(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();
}

fn cmd_build(cli: &Cli) -> Result<()> {
  let cwd = std::env::current_dir().context("Failed to read the current directory")?;
  let target = Target::locate(&cli.definition, &cwd);

  let mut config = Config::load(&cwd)
    .context("Failed to load configuration")?
    .with_target(target.path.clone(), cli.arch.clone())
    .finalize()
    .context("Invalid configuration")?;

  let workers = if config.instance.is_none() && supervisor::wants_workers(&config) {
    config.instance = Some(0);
    Workers::spawn(config.instances()).context("Failed to start worker instances")?
  } else {
    Workers::none()
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = match config.instance {
    Some(instance) => rt.block_on(run(&config, &target).instrument(info_span!("instance", instance))),
    None => rt.block_on(run(&config, &target)),
  };

  // Workers keep going on their own; the run only succeeds if all of them do.
  let waited = workers.wait();
  let outcome = outcome.with_context(|| format!("Failed to build {}", target.path))?;
  waited?;

  print_outcome(&outcome, cli.output)
}
