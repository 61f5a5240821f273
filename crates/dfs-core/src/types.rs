//! Core type definitions for the DFS
//!
//! These types are shared by the client library and the coordinating
//! server and define the fundamental units of the protocol.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CHUNKS_PER_FILE, CHUNK_SIZE};

/// Client session identifier, allocated by the server on first contact
pub type ClientId = u64;

/// Per-chunk version counter. Zero means the chunk was never written.
pub type ChunkVersion = u64;

/// A fixed-size block of file content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk([u8; CHUNK_SIZE]);

impl Chunk {
    /// A chunk of all zero bytes
    pub const ZERO: Chunk = Chunk([0; CHUNK_SIZE]);

    pub const fn new(bytes: [u8; CHUNK_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a chunk from a slice of at most 32 bytes, zero-padding the rest
    pub fn from_padded(data: &[u8]) -> Option<Self> {
        if data.len() > CHUNK_SIZE {
            return None;
        }
        let mut bytes = [0u8; CHUNK_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_SIZE] {
        &self.0
    }

    /// BLAKE3 checksum of the chunk content
    pub fn checksum(&self) -> [u8; 32] {
        *blake3::hash(&self.0).as_bytes()
    }

    /// Hex encoding used on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; CHUNK_SIZE];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; CHUNK_SIZE]> for Chunk {
    fn from(bytes: [u8; CHUNK_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({})", self.to_hex())
    }
}

impl Serialize for Chunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Chunk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Chunk::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid chunk hex"))
    }
}

/// Index of a chunk within a file (0..=255)
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkNum(u8);

impl ChunkNum {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Byte offset of this chunk inside the mirror file
    pub const fn byte_offset(&self) -> u64 {
        self.0 as u64 * CHUNK_SIZE as u64
    }

    /// Iterate over every chunk number of a file
    pub fn all() -> impl Iterator<Item = ChunkNum> {
        (0..=u8::MAX).map(ChunkNum)
    }
}

impl From<u8> for ChunkNum {
    fn from(index: u8) -> Self {
        Self(index)
    }
}

impl TryFrom<usize> for ChunkNum {
    type Error = usize;

    fn try_from(index: usize) -> Result<Self, usize> {
        u8::try_from(index).map(ChunkNum).map_err(|_| index)
    }
}

impl fmt::Display for ChunkNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of every chunk of a file, indexed by chunk number
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ChunkVersion>", into = "Vec<ChunkVersion>")]
pub struct ChunkVersions(Box<[ChunkVersion; CHUNKS_PER_FILE]>);

impl ChunkVersions {
    pub fn new() -> Self {
        Self(Box::new([0; CHUNKS_PER_FILE]))
    }

    pub fn get(&self, chunk: ChunkNum) -> ChunkVersion {
        self.0[chunk.index()]
    }

    pub fn set(&mut self, chunk: ChunkNum, version: ChunkVersion) {
        self.0[chunk.index()] = version;
    }

    /// Increment the version of a chunk, returning the new value
    pub fn bump(&mut self, chunk: ChunkNum) -> ChunkVersion {
        let slot = &mut self.0[chunk.index()];
        *slot += 1;
        *slot
    }

    /// Number of chunks that were ever written
    pub fn written_count(&self) -> usize {
        self.0.iter().filter(|v| **v > 0).count()
    }
}

impl Default for ChunkVersions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                ChunkNum::all()
                    .filter(|c| self.get(*c) > 0)
                    .map(|c| (c.index(), self.get(c))),
            )
            .finish()
    }
}

impl TryFrom<Vec<ChunkVersion>> for ChunkVersions {
    type Error = String;

    fn try_from(v: Vec<ChunkVersion>) -> Result<Self, String> {
        let len = v.len();
        let arr: Box<[ChunkVersion; CHUNKS_PER_FILE]> = v
            .into_boxed_slice()
            .try_into()
            .map_err(|_| format!("expected {} chunk versions, got {}", CHUNKS_PER_FILE, len))?;
        Ok(Self(arr))
    }
}

impl From<ChunkVersions> for Vec<ChunkVersion> {
    fn from(v: ChunkVersions) -> Self {
        v.0.to_vec()
    }
}

/// Access mode a file is opened with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// Connected read
    Read,
    /// Connected read/write, exclusive per filename
    Write,
    /// Disconnected read from the local cache
    Dread,
}

impl FileMode {
    /// Whether opening in this mode needs the coordinating server
    pub fn requires_server(self) -> bool {
        !matches!(self, FileMode::Dread)
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileMode::Read => "READ",
            FileMode::Write => "WRITE",
            FileMode::Dread => "DREAD",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(FileMode::Read),
            "write" => Ok(FileMode::Write),
            "dread" => Ok(FileMode::Dread),
            other => Err(format!("unknown file mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_offsets() {
        assert_eq!(ChunkNum::new(0).byte_offset(), 0);
        assert_eq!(ChunkNum::new(5).byte_offset(), 160);
        assert_eq!(ChunkNum::new(255).byte_offset(), 255 * 32);
        assert_eq!(ChunkNum::all().count(), 256);
    }

    #[test]
    fn test_chunk_num_bounds() {
        assert_eq!(ChunkNum::try_from(255usize), Ok(ChunkNum::new(255)));
        assert_eq!(ChunkNum::try_from(256usize), Err(256));
    }

    #[test]
    fn test_chunk_padding() {
        let chunk = Chunk::from_padded(b"hello").unwrap();
        assert_eq!(&chunk.as_bytes()[..5], b"hello");
        assert!(chunk.as_bytes()[5..].iter().all(|b| *b == 0));
        assert!(Chunk::from_padded(&[1u8; 33]).is_none());
    }

    #[test]
    fn test_chunk_json_is_hex() {
        let chunk = Chunk::new([0xab; CHUNK_SIZE]);
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(CHUNK_SIZE)));
        let parsed: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, chunk);

        assert!(serde_json::from_str::<Chunk>("\"abcd\"").is_err());
    }

    #[test]
    fn test_chunk_versions() {
        let mut versions = ChunkVersions::new();
        assert_eq!(versions.get(ChunkNum::new(3)), 0);
        assert_eq!(versions.bump(ChunkNum::new(3)), 1);
        assert_eq!(versions.bump(ChunkNum::new(3)), 2);
        assert_eq!(versions.written_count(), 1);

        let json = serde_json::to_string(&versions).unwrap();
        let parsed: ChunkVersions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, versions);

        assert!(serde_json::from_str::<ChunkVersions>("[1,2,3]").is_err());
    }

    #[test]
    fn test_file_mode_parse() {
        assert_eq!("READ".parse::<FileMode>(), Ok(FileMode::Read));
        assert_eq!("dread".parse::<FileMode>(), Ok(FileMode::Dread));
        assert!("append".parse::<FileMode>().is_err());
        assert!(FileMode::Write.requires_server());
        assert!(!FileMode::Dread.requires_server());
    }
}
