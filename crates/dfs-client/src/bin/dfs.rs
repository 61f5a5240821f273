//! DFS CLI - read and write chunks of shared files
//!
//! Usage:
//!   dfs exists <name>                  Check local and global existence
//!   dfs ls                             List locally cached files
//!   dfs read <name> <chunk> [--mode]   Print a chunk (READ, WRITE or DREAD)
//!   dfs write <name> <chunk> <text>    Write up to 32 bytes into a chunk

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dfs_client::{Chunk, ChunkNum, Dfs, FileMode};
use dfs_core::Config;

#[derive(Parser)]
#[command(name = "dfs")]
#[command(about = "Chunked distributed file system client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Coordinating server address (ip:port)
    #[arg(short, long, default_value = "127.0.0.1:7070", global = true)]
    server: String,

    /// Local IP to bind for the server session
    #[arg(short, long, default_value = "127.0.0.1", global = true)]
    local_ip: String,

    /// Local storage path (defaults to the config or system data dir)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Config file (defaults to the system config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a file exists locally and globally
    Exists { name: String },

    /// List locally cached files
    Ls,

    /// Print one chunk of a file
    Read {
        name: String,
        chunk: u8,
        /// Access mode: read, write or dread
        #[arg(short, long, default_value = "read")]
        mode: FileMode,
    },

    /// Write up to 32 bytes of text into one chunk of a file
    Write { name: String, chunk: u8, text: String },

    /// Print a sample configuration file
    ConfigSample,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    if let Commands::ConfigSample = cli.command {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let local_path = cli.path.clone().unwrap_or_else(|| config.local_path());

    let dfs = Dfs::mount_with_config(&cli.server, &cli.local_ip, &local_path, config.client).await?;

    let result = run(&dfs, cli.command).await;
    if dfs.is_connected() {
        if let Err(e) = dfs.unmount().await {
            error!("unmount failed: {}", e);
        }
    }
    result
}

async fn run(dfs: &Dfs, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Exists { name } => {
            println!("local:  {}", dfs.local_file_exists(&name)?);
            match dfs.global_file_exists(&name).await {
                Ok(exists) => println!("global: {}", exists),
                Err(e) => println!("global: unknown ({})", e),
            }
        }
        Commands::Ls => {
            for name in dfs.local_files()? {
                println!("{}", name);
            }
        }
        Commands::Read { name, chunk, mode } => {
            let mut file = dfs.open(&name, mode).await?;
            let data = file.read(ChunkNum::new(chunk)).await;
            file.close().await?;
            let data = data?;
            let text = String::from_utf8_lossy(data.as_bytes());
            println!("{}", text.trim_end_matches('\0'));
        }
        Commands::Write { name, chunk, text } => {
            let data = Chunk::from_padded(text.as_bytes())
                .ok_or("text is longer than one 32-byte chunk")?;
            let mut file = dfs.open(&name, FileMode::Write).await?;
            let written = file.write(ChunkNum::new(chunk), &data).await;
            file.close().await?;
            written?;
        }
        Commands::ConfigSample => print!("{}", Config::sample()),
    }
    Ok(())
}
