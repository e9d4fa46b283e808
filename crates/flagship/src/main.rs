//! # Flagship - Convoy cluster master
//!
//! Holds the authoritative copy of the cluster's synchronized files and
//! reconciles every worker against it.
//!
//! ## Architecture
//! ```text
//! Worker ─┐                    ┌─ SyncWorkflow → FileStore
//! Worker ─┼─ ClusterServer ────┼─ KeepAlive
//! Worker ─┘        ↑           └─ ForceSyncCoordinator
//!           ControlChannel (unix socket) ← flagship control
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cluster;
mod config;
mod control;
mod protocol;
mod state;
mod store;
mod sync;

use cluster::{ClusterServer, KeepAlive};
use config::AppConfig;
use control::ControlChannel;
use state::AppState;
use store::LocalFileStore;

/// Convoy Flagship - cluster master
#[derive(Parser, Debug)]
#[command(name = "flagship")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/flagship.toml", global = true)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the master (default)
    Serve(ServeArgs),

    /// Send a request to a running master through its control socket
    Control {
        /// Command name, e.g. `echo`, `file-status`, `force-sync`
        command: String,

        /// Node name, comma-separated names for force-sync, or `all`
        target: Option<String>,

        /// Request payload
        #[arg(trailing_var_arg = true)]
        payload: Vec<String>,

        /// Control socket path (overrides config)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

/// Overrides for `flagship serve`
#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Cluster listen address (overrides config)
    #[arg(short, long, env = "CONVOY_BIND")]
    bind: Option<String>,

    /// Cluster listen port (overrides config)
    #[arg(short, long, env = "CONVOY_PORT")]
    port: Option<u16>,

    /// Shared cluster key (overrides config)
    #[arg(long, env = "CONVOY_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Control socket path (overrides config)
    #[arg(long, env = "CONVOY_CONTROL_SOCKET")]
    control_socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    match &args.command {
        None => serve(&args.config, &ServeArgs::default()).await,
        Some(Commands::Serve(serve_args)) => serve(&args.config, serve_args).await,
        Some(Commands::Control {
            command,
            target,
            payload,
            socket,
        }) => {
            let socket = match socket {
                Some(path) => path.clone(),
                None => AppConfig::load(&args.config, &ServeArgs::default())?.control_socket,
            };

            let mut line = command.clone();
            for part in target.iter().chain(payload.iter()) {
                line.push(' ');
                line.push_str(part);
            }

            let answer = control::request(&socket, &line).await?;
            println!("{}", answer);
            Ok(())
        }
    }
}

async fn serve(config_path: &str, serve_args: &ServeArgs) -> Result<()> {
    info!("🚢 Starting Convoy Flagship v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(config_path, serve_args)?;
    config.validate().context("Invalid configuration")?;
    info!("📋 Configuration loaded from {}", config_path);

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Initialize application state
    let store = Arc::new(LocalFileStore::new(&config.data_dir));
    let state = AppState::new(config, store).await;
    info!(
        node = %state.node_name,
        data_dir = %state.config.data_dir.display(),
        items = state.config.cluster_items.len(),
        "✅ Master registered"
    );

    let server = ClusterServer::new(state.clone());

    // Bind endpoints before spawning anything
    let listen_addr = state.config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("🚀 Flagship listening on {}", listen_addr);

    let control_listener = ControlChannel::bind(&state.config.control_socket)?;
    info!(
        "🔧 Control socket at {}",
        state.config.control_socket.display()
    );

    // Spawn keep-alive loop
    let keep_alive = KeepAlive::new(Arc::new(server.clone()), state.config.keep_alive_interval());
    let keep_alive_task = tokio::spawn(keep_alive.run(shutdown_tx.subscribe()));

    // Spawn control channel
    let control = ControlChannel::new(server.clone());
    let control_shutdown = shutdown_tx.subscribe();
    let control_task = tokio::spawn(async move {
        control.run(control_listener, control_shutdown).await;
    });

    // Spawn accept loop
    let accept_server = server.clone();
    let accept_shutdown = shutdown_tx.subscribe();
    let accept_task = tokio::spawn(async move {
        accept_server.run(listener, accept_shutdown).await;
    });

    // Handle graceful shutdown
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = tokio::join!(keep_alive_task, control_task, accept_task);
    state.syncs.drain().await;

    if let Err(e) = std::fs::remove_file(&state.config.control_socket) {
        tracing::debug!(error = %e, "Control socket already gone");
    }

    info!("👋 Flagship shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
