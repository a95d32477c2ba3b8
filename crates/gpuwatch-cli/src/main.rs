//! `gpuwatch` – GPU telemetry broadcast service.
//!
//! 1. Resolves configuration (defaults, optional TOML file, `GPU_MONITOR_*`
//!    environment overrides).
//! 2. Selects a telemetry provider, falling back through NVML, `nvidia-smi`
//!    and `nvtop`.
//! 3. Polls it on a fixed interval and streams rate-limited, de-duplicated
//!    snapshots to WebSocket clients on `/ws/gpu`.
//! 4. Intercepts **Ctrl-C** to stop the listener and release the backend.

mod app;
mod config;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gpuwatch_telemetry::ProviderSelector;
use tokio::sync::watch;
use tracing::{error, info, warn};

use config::Config;

/// GPU telemetry broadcast service.
#[derive(Debug, Parser)]
#[command(name = "gpuwatch", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "GPUWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging is not up yet; configuration errors go straight to stderr.
    let cfg = match Config::resolve(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("gpuwatch: {e}");
            return ExitCode::from(2);
        }
    };

    let _guard = logging::init_tracing("gpuwatch", &cfg.log_level);
    info!(?cfg, "configuration resolved");

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // The sender outlives the handler so a failed install does not read as
    // an immediate shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let handler_tx = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown requested");
        let _ = handler_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown will not be available");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let selector = ProviderSelector::with_default_backends();
    let outcome = runtime.block_on(app::run(&cfg, &selector, shutdown_rx));
    drop(shutdown_tx);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gpuwatch exited with an error");
            ExitCode::FAILURE
        }
    }
}
