//! Error types for the DFS client and protocol

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChunkNum, FileMode};

/// Errors reported to applications using the DFS
///
/// Every variant names a condition the caller can act on: reopen,
/// reconnect, rename, or wait. Transport failures of any kind are
/// reported as `Disconnected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DfsError {
    #[error("not connected to server [{0}]")]
    Disconnected(String),

    #[error("latest version of chunk [{0}] unavailable")]
    ChunkUnavailable(ChunkNum),

    #[error("filename [{0}] is opened for writing by another client")]
    OpenWriteConflict(String),

    #[error("cannot perform this operation in current file mode [{0}]")]
    BadFileMode(FileMode),

    #[error("write access to filename [{0}] has timed out; reopen the file")]
    WriteModeTimeout(String),

    #[error("filename [{0}] includes illegal characters or has the wrong length")]
    BadFilename(String),

    #[error("filename [{0}] is unavailable")]
    FileUnavailable(String),

    #[error("cannot access local path [{}]", .0.display())]
    LocalPath(PathBuf),

    #[error("cannot open file [{0}] in DREAD mode as it does not exist locally")]
    FileDoesNotExist(String),

    /// Address resolution or socket setup failed while mounting
    #[error("network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, DfsError>;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("timeout")]
    Timeout,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Wire error codes (sent over network)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unknown,
    ProtocolError,
    BadFilename,
    UnknownClient,
    FileNotFound,
}
