mod app;
mod commands;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use orgsync::config::{Config, LogConfig};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orgsync")]
#[command(about = "Synchronized client for organization resources behind a REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/orgsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Resource kind to operate on (overrides backend.resource)
  #[arg(short, long)]
  kind: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file; stdout carries command output.
fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
  let dir = config.dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "orgsync.log"));
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.log)?;

  // Initialize and run the app
  let mut app = app::App::new(config, args.kind).await?;
  let result = app.run(args.command).await;
  app.shutdown();

  result
}
