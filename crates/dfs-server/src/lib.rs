//! DFS Server - reference coordinating server
//!
//! Arbitrates global file existence, write-lock ownership, and chunk
//! version propagation across clients. State is kept in memory; the
//! latest committed content of every chunk is retained so any connected
//! client can fetch it.

pub mod file_table;
pub mod lock_manager;
pub mod server;

pub use file_table::{ChunkCopy, ChunkLookup, FileRecord, FileTable};
pub use lock_manager::{LockError, LockHold, LockManager};
pub use server::{ClientInfo, Coordinator, CoordinatingServer, ServerError};
