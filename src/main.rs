//! MCP WebSocket gateway server
//!
//! Thin binary around the gateway library: parses arguments, configures
//! logging, wires logging callbacks into the transport, and tears it down on
//! SIGINT/SIGTERM.

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mcp_ws_gateway::{GatewayConfig, WebSocketGateway};

/// MCP WebSocket gateway
///
/// Accepts a single MCP client over WebSocket and logs its traffic
#[derive(Parser, Debug)]
#[command(name = "mcp-ws-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("mcp-ws-gateway v{}", env!("CARGO_PKG_VERSION"));

    let gateway = WebSocketGateway::new(GatewayConfig::new(args.port).with_host(args.host));

    gateway.on_connect(|handle| info!("client connected: {} ({})", handle.id, handle.peer));
    gateway.on_message(|message| info!("message received: {message:?}"));
    gateway.on_close(|| info!("client disconnected"));
    gateway.on_error(|error| warn!("transport fault: {error}"));

    gateway.start().await?;

    shutdown_signal().await;
    info!("shutting down...");
    gateway.close().await;

    info!("gateway shutdown complete");
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
