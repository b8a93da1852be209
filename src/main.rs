//! cnc-daemon: command-and-control node
//!
//! Listens for commands arriving over a named-pipe link, runs the matching
//! plugin handler and sends an acknowledgment back to the commanding peer.
//! Configuration via CLI arguments or TOML file.

use cnc_daemon::config::Config;
use cnc_daemon::daemon::{self, Daemon};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = config.address,
        port = config.port,
        rx = %config.rx_path.display(),
        tx = %config.tx_path.display(),
        plugins = %config.plugin_dir.display(),
        "Starting cnc-daemon"
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::from(3);
        }
    };

    // A handler stuck in a plugin must not keep the process alive
    daemon::block_on_bounded(runtime, run(config), daemon::SHUTDOWN_GRACE)
}

async fn run(config: Config) -> ExitCode {
    let mut daemon = match Daemon::start(&config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::from(e.exit_code());
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = daemon.run(shutdown).await;
    daemon.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = term.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
