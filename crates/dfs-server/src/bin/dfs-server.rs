//! DFS coordinating server
//!
//! # Usage
//!
//! ```bash
//! # Defaults (0.0.0.0:7070, 30s write lease)
//! dfs-server
//!
//! # Custom port and a short lease
//! dfs-server --port 9000 --lease-ms 5000
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dfs_core::Config;
use dfs_server::CoordinatingServer;

#[derive(Parser, Debug)]
#[command(name = "dfs-server")]
#[command(about = "Coordinating server for the chunked DFS")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Write lease in milliseconds (overrides config)
    #[arg(long)]
    lease_ms: Option<u64>,

    /// Config file (defaults to the system config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    }
    .server;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(lease_ms) = args.lease_ms {
        config.lease_ms = lease_ms;
    }

    info!("Starting DFS coordinating server");
    info!("Write lease: {:?}", config.lease());

    let server = CoordinatingServer::bind(&config).await?;
    server.serve().await?;

    Ok(())
}
