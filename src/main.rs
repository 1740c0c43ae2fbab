//! Mount indexed container-image layers lazily over FUSE.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod app_config;
mod daemon;

use crate::app_config::Config;

#[derive(Parser)]
#[command(version, about = "Lazy-pulling FUSE filesystem for indexed image layers.")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_parser)]
    config_path: Option<PathBuf>,
}

/// Initialize tracing from `STARGZ_FS_LOG`, falling back to `RUST_LOG`,
/// then to `info` (or `debug` when the config asks for it).
fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("STARGZ_FS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Load config first; errors use eprintln since tracing isn't up yet.
    let config = match Config::load(args.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.filesystem.debug);

    if let Err(e) = daemon::run(config) {
        error!("daemon failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
