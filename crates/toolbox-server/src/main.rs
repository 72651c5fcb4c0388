//! toolbox-server: shared backend connections and browser terminal sessions.
//!
//! Serves WebSocket terminals (local PTY or SSH) and a JSON API for command
//! history, SFTP transfers, output logs and Elasticsearch, all on top of one
//! idle-evicting connection cache.

mod adapters;
mod api;
mod config;
mod server;
mod session;
mod store;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::ToolboxServer;
use std::path::PathBuf;
use tracing::{error, info};

/// toolbox-server: terminal sessions and cached backend connections
#[derive(Parser, Debug)]
#[command(name = "toolbox-server", version, about = "Terminal and backend toolbox server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.toolbox/config.toml")]
    config: String,

    /// Directory for terminal output logs
    #[arg(long)]
    log_dir: Option<String>,

    /// SQLite file for command history (in-memory when unset)
    #[arg(long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting toolbox-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        log_dir: cli.log_dir,
        database: cli.database,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match ToolboxServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    let failed = tokio::select! {
        result = server.run() => match result {
            Ok(()) => false,
            Err(e) => {
                error!(error = %e, "server error");
                true
            }
        },
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            false
        }
    };

    server.shutdown().await;
    info!("toolbox-server stopped");
    if failed {
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
