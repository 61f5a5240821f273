//! DFS Core - Shared types, error kinds, and wire protocol
//!
//! This crate contains the foundational types used by both the client
//! library and the coordinating server. It has no dependencies on
//! networking or on-disk layout.

pub mod config;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{ClientConfig, Config, ConfigError, ServerConfig};
pub use error::*;
pub use path::{check_filename, validate_filename};
pub use protocol::*;
pub use types::*;

/// Chunk size in bytes
pub const CHUNK_SIZE: usize = 32;

/// Number of addressable chunks per file
pub const CHUNKS_PER_FILE: usize = 256;

/// Maximum filename length in characters
pub const MAX_FILENAME_LEN: usize = 16;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Receive buffer size for a single datagram
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default port the coordinating server listens on
pub const DEFAULT_SERVER_PORT: u16 = 7070;

/// Default write lease in seconds
pub const DEFAULT_LEASE_SECS: u64 = 30;
