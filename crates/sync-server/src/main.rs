use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_server::{AppState, FileStore};

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Serve a folder as the remote side of folder-sync")]
struct Cli {
    /// Folder to serve
    #[arg(short, long, env = "SYNC_SERVER_FOLDER")]
    folder: PathBuf,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SYNC_SERVER_BIND")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "SYNC_SERVER_PORT")]
    port: u16,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sync_server=debug,sync_core=debug,tower_http=debug"
    } else {
        "sync_server=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = FileStore::open(&cli.folder)
        .with_context(|| format!("Failed to open {}", cli.folder.display()))?;
    let state = Arc::new(AppState::new(store));

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    tracing::info!("Starting sync-server on {}", addr);
    tracing::info!("Serving {:?}", cli.folder);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    sync_server::serve(listener, state, shutdown_signal()).await?;

    tracing::info!("Sync server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received");
}
