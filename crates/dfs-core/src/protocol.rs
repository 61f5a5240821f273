//! Wire protocol definitions
//!
//! All network messages are defined here. Each message is a single JSON
//! document carried in one datagram; there is no length prefix, so a
//! message must fit in `MAX_MESSAGE_SIZE` bytes.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};
use crate::types::{Chunk, ChunkNum, ChunkVersion, ChunkVersions, ClientId, FileMode};
use crate::MAX_MESSAGE_SIZE;

/// A request from a client, tagged with a sequence number so the client
/// can discard late replies to requests it already gave up on
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    pub client_id: Option<ClientId>,
    pub body: Request,
}

/// A reply from the server echoing the request's sequence number
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub seq: u64,
    pub body: Reply,
}

/// Client → server messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Identity handshake; `client_id` is the persisted id, if any
    Hello {
        protocol_version: u32,
        client_id: Option<ClientId>,
    },

    /// Liveness probe
    Ping { timestamp: u64 },

    /// Global existence query
    Exists { filename: String },

    /// Open a file in READ or WRITE mode, creating it if needed
    Open { filename: String, mode: FileMode },

    /// Fetch a chunk unless `known_version` is already the latest
    FetchChunk {
        filename: String,
        chunk: ChunkNum,
        known_version: ChunkVersion,
    },

    /// Commit new content for a chunk under the caller's write lease
    CommitChunk {
        filename: String,
        chunk: ChunkNum,
        data: Chunk,
        checksum: String,
    },

    /// Release the write lock held on a file
    ReleaseLock { filename: String },

    /// Client is leaving; release everything it holds
    Goodbye,
}

/// Server → client messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    HelloAck {
        protocol_version: u32,
        client_id: ClientId,
    },

    Pong { timestamp: u64 },

    Exists { exists: bool },

    /// Open granted; `lease_ms` is set for WRITE opens
    Opened {
        versions: ChunkVersions,
        lease_ms: Option<u64>,
    },

    /// Another session holds the write lock
    WriteConflict { holder: Option<ClientId> },

    /// The latest state of the file cannot be sourced right now
    FileUnavailable,

    /// The caller's cached version is the latest
    UpToDate { version: ChunkVersion },

    Chunk {
        version: ChunkVersion,
        data: Chunk,
        checksum: String,
    },

    /// The chunk exists at `version` but its content cannot be sourced
    Unavailable { version: ChunkVersion },

    /// Commit accepted; the lease was renewed for `lease_ms`
    Committed {
        version: ChunkVersion,
        lease_ms: u64,
    },

    /// The write lease is no longer held
    LeaseExpired,

    Released,

    Error { code: ErrorCode, message: String },
}

impl Reply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name used in logs and unexpected-reply errors
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::HelloAck { .. } => "hello_ack",
            Reply::Pong { .. } => "pong",
            Reply::Exists { .. } => "exists",
            Reply::Opened { .. } => "opened",
            Reply::WriteConflict { .. } => "write_conflict",
            Reply::FileUnavailable => "file_unavailable",
            Reply::UpToDate { .. } => "up_to_date",
            Reply::Chunk { .. } => "chunk",
            Reply::Unavailable { .. } => "unavailable",
            Reply::Committed { .. } => "committed",
            Reply::LeaseExpired => "lease_expired",
            Reply::Released => "released",
            Reply::Error { .. } => "error",
        }
    }
}

/// Hex-encoded BLAKE3 checksum of a chunk, as carried on the wire
pub fn chunk_checksum(chunk: &Chunk) -> String {
    hex::encode(chunk.checksum())
}

/// Check a received chunk against its wire checksum
pub fn verify_chunk(chunk: &Chunk, checksum: &str) -> Result<(), ProtocolError> {
    if chunk_checksum(chunk) == checksum {
        Ok(())
    } else {
        Err(ProtocolError::ChecksumMismatch)
    }
}

/// Serialize a message into a single datagram payload
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes =
        serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Deserialize a message from a datagram payload
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tagging() {
        let env = RequestEnvelope {
            seq: 7,
            client_id: Some(3),
            body: Request::Open {
                filename: "abc".into(),
                mode: FileMode::Write,
            },
        };
        let bytes = encode(&env).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["body"]["type"], "open");
        assert_eq!(value["body"]["mode"], "write");

        let decoded: RequestEnvelope = decode(&bytes).unwrap();
        assert_eq!(decoded.body, env.body);
    }

    #[test]
    fn test_opened_reply_fits_datagram() {
        let mut versions = ChunkVersions::new();
        for c in ChunkNum::all() {
            versions.set(c, u64::MAX);
        }
        let env = ReplyEnvelope {
            seq: 1,
            body: Reply::Opened {
                versions,
                lease_ms: Some(30_000),
            },
        };
        let bytes = encode(&env).unwrap();
        assert!(bytes.len() < MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_chunk_checksum_verification() {
        let chunk = Chunk::new([9; 32]);
        let sum = chunk_checksum(&chunk);
        assert!(verify_chunk(&chunk, &sum).is_ok());
        assert!(matches!(
            verify_chunk(&Chunk::ZERO, &sum),
            Err(ProtocolError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode::<ReplyEnvelope>(b"not json").is_err());
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            decode::<ReplyEnvelope>(&big),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
