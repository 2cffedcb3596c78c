#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hawser
//!
//! Docker agent for the Dockhand control plane.
//!
//! ## Subcommands
//!
//! - `hawser` (default): edge mode when `DOCKHAND_SERVER_URL` is set, else standard
//! - `hawser standard [--port N]`: serve the Docker API over HTTP(S)
//! - `hawser edge`: dial out to the control plane and serve calls over the tunnel
//!
//! ## Standard mode surface
//!
//! | Method | Path              | Auth | Description                       |
//! |--------|-------------------|------|-----------------------------------|
//! | GET    | `/_hawser/health` | No   | Liveness check (pings the daemon) |
//! | GET    | `/_hawser/info`   | Yes  | Agent identity and daemon version |
//! | *      | anything else     | Yes  | Forwarded verbatim to Docker      |
//!
//! Auth is the `X-Hawser-Token` header, or `?token=` when a header cannot be set.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hawser::config::Config;
use hawser::docker::{DockerApi, DockerClient};
use hawser::error::{AgentError, Result};
use hawser::{server, TunnelClient};

/// Docker agent for the Dockhand control plane.
#[derive(Parser)]
#[command(name = "hawser", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Docker API on an HTTP(S) port.
    Standard {
        /// Listen port, overriding `PORT` and the config file.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect out to the control plane (needs `DOCKHAND_SERVER_URL`).
    Edge,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hawser: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run(cli.command, config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(command: Option<Commands>, config: Config) -> Result<()> {
    info!("hawser v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Agent: {} ({})", config.agent.name, config.agent.id);
    info!("Docker socket: {}", config.docker.socket);

    let config = Arc::new(config);
    let docker: Arc<dyn DockerApi> = Arc::new(DockerClient::new(
        &config.docker.socket,
        config.docker_connect_timeout(),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    let edge = match command {
        Some(Commands::Edge) => {
            if !config.edge_mode() {
                return Err(AgentError::Config(
                    "edge mode requires DOCKHAND_SERVER_URL".into(),
                ));
            }
            true
        }
        Some(Commands::Standard { .. }) => false,
        None => config.edge_mode(),
    };

    if edge {
        info!("Mode: edge");
        TunnelClient::new(Arc::clone(&config), docker)
            .run(shutdown)
            .await?;
    } else {
        info!("Mode: standard");
        let port = match command {
            Some(Commands::Standard { port }) => port,
            _ => None,
        };
        server::run(config, docker, port, shutdown).await?;
    }

    info!("Goodbye");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
