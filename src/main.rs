//! The orchestrator binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tactboard::app::{self, BootOptions};
use tactboard::config::Config;

/// Universal driver for reed-switch electronic chessboards.
#[derive(Debug, Parser)]
#[command(name = "tactboard", version, about)]
struct Cli {
    /// Resume the unterminated game even if other checks would skip it.
    #[arg(long, conflicts_with = "no_resume")]
    resume: bool,

    /// Never resume; always boot into the menu.
    #[arg(long)]
    no_resume: bool,

    /// Disable the Bluetooth transport.
    #[arg(long)]
    no_bt: bool,

    /// Render to the simulated display (development without hardware).
    #[arg(long)]
    simulated_display: bool,

    /// Configuration file path.
    #[arg(long, default_value = "/etc/tactboard/tactboard.toml")]
    config: PathBuf,

    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let opts = BootOptions {
        resume: match (cli.resume, cli.no_resume) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        },
        no_bt: cli.no_bt,
        simulated_display: cli.simulated_display,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime start failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(app::run(config, opts, None)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
