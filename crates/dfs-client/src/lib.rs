//! DFS Client - chunked distributed file system client library
//!
//! This crate provides:
//! - A local cache store mirroring every file the client has seen
//! - A connection manager owning the session with the coordinating server
//! - Per-file sessions enforcing READ / WRITE / DREAD access rules
//! - The `Dfs` mount that ties them together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  open   ┌──────────────┐
//! │     Dfs      │────────▶│   DfsFile    │
//! └──────┬───────┘         └──┬────────┬──┘
//!        │ mount              │        │ always
//!        ▼                    ▼        ▼
//! ┌──────────────────┐  ┌──────────────────┐
//! │ConnectionManager │  │ LocalCacheStore  │
//! └────────┬─────────┘  └──────────────────┘
//!          │ JSON over UDP (when connected)
//!          ▼
//!   coordinating server
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dfs_client::{Chunk, ChunkNum, Dfs, FileMode};
//!
//! # async fn run() -> dfs_client::Result<()> {
//! let dfs = Dfs::mount("127.0.0.1:7070", "127.0.0.1", "/tmp/dfs-a").await?;
//! let mut file = dfs.open("notes1", FileMode::Write).await?;
//! file.write(ChunkNum::new(0), &Chunk::from_padded(b"hello").unwrap()).await?;
//! let chunk = file.read(ChunkNum::new(0)).await?;
//! file.close().await?;
//! dfs.unmount().await?;
//! # let _ = chunk;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection_manager;
pub mod file;
pub mod local_cache;
pub mod net;

pub use client::Dfs;
pub use connection_manager::{ConnectionManager, Session};
pub use file::{DfsFile, HandleState, Op};
pub use local_cache::{LocalCacheStore, LocalRecord, SlotSnapshot};

pub use dfs_core::{check_filename, Chunk, ChunkNum, ClientConfig, DfsError, FileMode, Result};
