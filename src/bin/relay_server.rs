//! Standalone relay server binary
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 3000
//!
//! With TLS:
//!   cargo run --bin relay-server -- --port 3443 --cert cert.pem --key key.pem

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duocall::signaling::{tls_acceptor, RelayServer};

/// Room relay for duocall endpoints
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Room relay for duocall endpoints")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let server = RelayServer::new();

    match (args.cert, args.key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls_acceptor(&cert, &key)?;
            let listener = TcpListener::bind(addr).await?;
            info!("Relay server listening on {} (wss://)", addr);
            server.serve_tls(listener, acceptor).await?;
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            server.run(&addr.to_string()).await?;
        }
        _ => bail!("Both --cert and --key must be provided for TLS"),
    }

    Ok(())
}
