//! In-memory file table: global existence, chunk versions, and the latest
//! committed content of every chunk

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use dfs_core::{Chunk, ChunkNum, ChunkVersion, ChunkVersions, ClientId};

/// Latest committed content of a chunk
#[derive(Clone, Debug)]
pub struct ChunkCopy {
    pub data: Chunk,
    pub version: ChunkVersion,
}

/// Server-side record of one file
#[derive(Clone, Debug, Default)]
pub struct FileRecord {
    pub versions: ChunkVersions,
    pub chunks: HashMap<ChunkNum, ChunkCopy>,
}

impl FileRecord {
    /// Whether every written chunk has retrievable content
    pub fn fully_available(&self) -> bool {
        ChunkNum::all().all(|c| {
            let version = self.versions.get(c);
            version == 0
                || self
                    .chunks
                    .get(&c)
                    .map(|copy| copy.version == version)
                    .unwrap_or(false)
        })
    }
}

/// Result of looking up a chunk for a reader
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkLookup {
    /// The reader's copy is current (or the chunk was never written)
    UpToDate(ChunkVersion),
    Fetched(Chunk, ChunkVersion),
    Unavailable(ChunkVersion),
}

/// All files known to the server
#[derive(Default)]
pub struct FileTable {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.files.read().contains_key(filename)
    }

    /// Return the file's record, creating an empty one on first sight
    pub fn get_or_create(&self, filename: &str) -> FileRecord {
        let mut files = self.files.write();
        files
            .entry(filename.to_string())
            .or_insert_with(|| {
                debug!("Created file {}", filename);
                FileRecord::default()
            })
            .clone()
    }

    /// Versions of every chunk, if the file exists
    pub fn versions(&self, filename: &str) -> Option<ChunkVersions> {
        self.files.read().get(filename).map(|f| f.versions.clone())
    }

    /// Look up a chunk for a reader that holds `known_version`
    pub fn lookup(
        &self,
        filename: &str,
        chunk: ChunkNum,
        known_version: ChunkVersion,
    ) -> Option<ChunkLookup> {
        let files = self.files.read();
        let record = files.get(filename)?;
        let current = record.versions.get(chunk);

        if current == 0 || current == known_version {
            return Some(ChunkLookup::UpToDate(current));
        }

        Some(match record.chunks.get(&chunk) {
            Some(copy) if copy.version == current => ChunkLookup::Fetched(copy.data, current),
            _ => ChunkLookup::Unavailable(current),
        })
    }

    /// Store new content for a chunk and advance its version by one
    pub fn commit(
        &self,
        filename: &str,
        chunk: ChunkNum,
        data: Chunk,
        writer: ClientId,
    ) -> ChunkVersion {
        let mut files = self.files.write();
        let record = files.entry(filename.to_string()).or_default();
        let version = record.versions.bump(chunk);
        record.chunks.insert(chunk, ChunkCopy { data, version });
        debug!(
            "Committed {}[{}] v{} by client {}",
            filename, chunk, version, writer
        );
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_exists() {
        let table = FileTable::new();
        assert!(!table.exists("abc"));
        assert!(table.versions("abc").is_none());

        let record = table.get_or_create("abc");
        assert_eq!(record.versions.written_count(), 0);
        assert!(table.exists("abc"));
        assert!(!table.exists("abd"));
    }

    #[test]
    fn test_commit_increments_once_per_write() {
        let table = FileTable::new();
        table.get_or_create("abc");

        let c = ChunkNum::new(5);
        assert_eq!(table.commit("abc", c, Chunk::new([1; 32]), 1), 1);
        assert_eq!(table.commit("abc", c, Chunk::new([2; 32]), 1), 2);
        assert_eq!(table.versions("abc").unwrap().get(c), 2);
        assert_eq!(table.versions("abc").unwrap().get(ChunkNum::new(4)), 0);
    }

    #[test]
    fn test_lookup() {
        let table = FileTable::new();
        table.get_or_create("abc");
        let c = ChunkNum::new(0);

        assert_eq!(table.lookup("abc", c, 0), Some(ChunkLookup::UpToDate(0)));
        assert_eq!(table.lookup("nope", c, 0), None);

        table.commit("abc", c, Chunk::new([3; 32]), 9);
        assert_eq!(
            table.lookup("abc", c, 0),
            Some(ChunkLookup::Fetched(Chunk::new([3; 32]), 1))
        );
        assert_eq!(table.lookup("abc", c, 1), Some(ChunkLookup::UpToDate(1)));
    }

    #[test]
    fn test_missing_content_is_unavailable() {
        let table = FileTable::new();
        let c = ChunkNum::new(2);
        table.commit("abc", c, Chunk::ZERO, 1);
        table.files.write().get_mut("abc").unwrap().chunks.clear();

        assert_eq!(table.lookup("abc", c, 0), Some(ChunkLookup::Unavailable(1)));
        assert!(!table.get_or_create("abc").fully_available());
    }
}
