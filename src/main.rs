mod cache;
mod commands;
mod config;
mod error;
mod http;
mod network;
mod worker;

use clap::{ArgAction, Parser};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "An offline cache manager for a single-origin storefront shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(short, long, global = true)]
  origin: Option<String>,

  /// Keep caches in memory for this run only
  #[arg(long, global = true)]
  memory: bool,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose);

  // Load configuration
  let config = config::Config::load(args.config.as_deref(), args.origin.as_deref())?;

  commands::execute(args.command, &config, args.memory).await
}

/// Log to stderr at the requested verbosity, and at debug level to a file
/// in the data directory. `SHELLCACHE_LOG` overrides the stderr filter.
fn init_logging(verbose: u8) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("SHELLCACHE_LOG").unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("shellcache=warn"),
    1 => EnvFilter::new("shellcache=info"),
    _ => EnvFilter::new("shellcache=debug"),
  });
  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .without_time()
    .with_filter(filter);

  let (file_layer, guard) = match log_appender() {
    Some(appender) => {
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new("shellcache=debug"));
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .init();

  guard
}

fn log_appender() -> Option<RollingFileAppender> {
  let dir = dirs::data_dir()?.join("shellcache");
  std::fs::create_dir_all(&dir).ok()?;

  RollingFileAppender::builder()
    .rotation(Rotation::NEVER)
    .filename_prefix("shellcache")
    .filename_suffix("log")
    .build(dir)
    .ok()
}
