//! sync-daemon: keeps a local folder and a sync-server consistent.
//!
//! Live filesystem events and a periodic full comparison both feed one
//! intake queue; a small worker pool reconciles one path at a time.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sync_daemon::{Args, ClientConfig, FileWatcher, RuntimeOptions, SyncRuntime, build_engine};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info,sync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ClientConfig::from(args);
    info!("Starting sync-daemon");
    info!("Folder: {:?}", config.folder);
    info!("Server: {}", config.server);

    let engine = Arc::new(build_engine(&config)?);

    let watcher = match FileWatcher::new(config.folder.clone(), config.engine.ignore.clone()) {
        Ok(watcher) => {
            info!("File watcher started");
            Some(watcher)
        }
        Err(e) => {
            // Polling alone still converges, just later
            warn!("File watcher unavailable, relying on polling: {}", e);
            None
        }
    };

    let runtime = SyncRuntime::start(engine, watcher, RuntimeOptions::from(&config));
    info!("Daemon running. Press Ctrl+C to stop.");

    shutdown_signal().await;
    runtime.shutdown().await?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
