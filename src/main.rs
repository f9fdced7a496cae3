//! Relay Bridge Server
//!
//! Minimal real-time WebSocket relay. Every message a client sends is
//! rebroadcast to all connected clients, tagged with the sender's identity.

mod config;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::RelayConfig;
use server::{ServerConfig, WebSocketServer};

/// Relay Bridge Server
///
/// WebSocket relay that rebroadcasts every message to all connected clients
#[derive(Parser, Debug)]
#[command(name = "relay-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not send broadcasts back to the client that sent them
    #[arg(long)]
    exclude_sender: bool,

    /// Relay raw payloads without the "Client <id>: " prefix
    #[arg(long)]
    untagged: bool,
}

impl Args {
    /// Resolve the relay configuration: flags override the file, the file
    /// overrides defaults
    fn relay_config(&self) -> Result<RelayConfig, config::ConfigError> {
        let mut relay = RelayConfig::load_or_default(self.config.as_deref())?;
        if self.exclude_sender {
            relay = relay.exclude_sender();
        }
        if self.untagged {
            relay = relay.untagged();
        }
        Ok(relay)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Relay Bridge v{}", env!("CARGO_PKG_VERSION"));

    let relay = args.relay_config()?;
    info!(
        "Broadcast mode: include_sender={}, tag_sender={}",
        relay.router.include_sender, relay.router.tag_sender
    );

    let config = ServerConfig::new(args.bind, args.port).with_relay(relay);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
