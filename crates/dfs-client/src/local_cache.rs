//! Local Cache Store - per-client on-disk mirror of files and chunks
//!
//! Every file the client has seen is mirrored under the mount's local
//! path, together with a small record of which chunk slots hold data and
//! the version each slot was last synchronized at. The client's session
//! identity lives next to them.
//!
//! # File Layout
//! ```text
//! <local_path>/
//! ├── id.txt              # client id as decimal text (empty until assigned)
//! ├── notes1.dfs          # sparse mirror, chunk N at byte offset N * 32
//! └── notes1.meta.json    # cached versions + present slots
//! ```
//!
//! Every I/O failure collapses into `DfsError::LocalPath` carrying the
//! offending path; none of them are recoverable at this layer.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use dfs_core::{
    Chunk, ChunkNum, ChunkVersion, ChunkVersions, ClientId, DfsError, Result, CHUNK_SIZE,
};

/// Name of the persisted identity file
pub const ID_FILE: &str = "id.txt";

/// Extension of chunk mirror files
pub const MIRROR_EXT: &str = "dfs";

const RECORD_SUFFIX: &str = ".meta.json";
const PROBE_FILE: &str = ".dfs-probe";

/// Local knowledge about one file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Version each slot was last synchronized at (0 = unknown)
    pub versions: ChunkVersions,
    /// Slots that hold data in the mirror file
    pub present: BTreeSet<ChunkNum>,
}

/// A mirror slot as it was before an unconfirmed write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    data: Option<Chunk>,
    version: ChunkVersion,
}

/// On-disk chunk mirror rooted at the mount's local path
pub struct LocalCacheStore {
    root: PathBuf,
}

fn local_path_error(path: &Path) -> impl FnOnce(io::Error) -> DfsError + '_ {
    move |e| {
        warn!("Local I/O failed on {:?}: {}", path, e);
        DfsError::LocalPath(path.to_path_buf())
    }
}

impl LocalCacheStore {
    /// Open the store, creating `root` if needed and checking it is writable
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(local_path_error(&root))?;

        let probe = root.join(PROBE_FILE);
        File::create(&probe)
            .and_then(|mut f| f.write_all(b"ok"))
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| {
                warn!("Local path {:?} is not writable: {}", root, e);
                DfsError::LocalPath(root.clone())
            })?;

        debug!("Local cache store opened at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mirror_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, MIRROR_EXT))
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, RECORD_SUFFIX))
    }

    /// True iff a mirror for `name` has been materialized, even partially
    pub fn file_exists_locally(&self, name: &str) -> bool {
        self.mirror_path(name).is_file()
    }

    /// Create an empty mirror and record for `name` if they do not exist yet
    pub fn materialize(&self, name: &str) -> Result<()> {
        let mirror = self.mirror_path(name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&mirror)
            .map_err(local_path_error(&mirror))?;

        if !self.record_path(name).exists() {
            self.save_record(name, &LocalRecord::default())?;
        }
        Ok(())
    }

    /// Load the record for `name`; a missing record is an empty one
    pub fn record(&self, name: &str) -> Result<LocalRecord> {
        let path = self.record_path(name);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                warn!("Corrupt local record {:?}: {}", path, e);
                DfsError::LocalPath(path)
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LocalRecord::default()),
            Err(e) => Err(local_path_error(&path)(e)),
        }
    }

    /// Write a record durably (temp file + rename)
    fn save_record(&self, name: &str, record: &LocalRecord) -> Result<()> {
        let path = self.record_path(name);
        let bytes = serde_json::to_vec(record).map_err(|e| {
            warn!("Failed to encode local record for {}: {}", name, e);
            DfsError::LocalPath(path.clone())
        })?;
        write_atomic(&path, &bytes)
    }

    /// Version the local copy of a chunk was last synchronized at
    pub fn cached_version(&self, name: &str, chunk: ChunkNum) -> Result<ChunkVersion> {
        Ok(self.record(name)?.versions.get(chunk))
    }

    /// Read a chunk from the mirror
    ///
    /// Fails with `ChunkUnavailable` if the slot was never written locally.
    pub fn read_chunk_local(&self, name: &str, chunk: ChunkNum) -> Result<Chunk> {
        if !self.record(name)?.present.contains(&chunk) {
            return Err(DfsError::ChunkUnavailable(chunk));
        }

        let path = self.mirror_path(name);
        let mut file = File::open(&path).map_err(local_path_error(&path))?;
        let mut bytes = [0u8; CHUNK_SIZE];
        file.seek(SeekFrom::Start(chunk.byte_offset()))
            .and_then(|_| file.read_exact(&mut bytes))
            .map_err(local_path_error(&path))?;

        trace!("local_cache: read {}[{}]", name, chunk);
        Ok(Chunk::new(bytes))
    }

    /// Write a chunk into the mirror, flushing it to disk before returning
    ///
    /// With `Some(version)` the slot is recorded as synchronized at that
    /// version. With `None` the slot's version is reset to unknown until
    /// `set_cached_version` confirms it, so an unacknowledged local write
    /// is never mistaken for the server's latest content.
    pub fn write_chunk_local(
        &self,
        name: &str,
        chunk: ChunkNum,
        data: &Chunk,
        version: Option<ChunkVersion>,
    ) -> Result<()> {
        self.write_slot(name, chunk, data)?;

        let mut record = self.record(name)?;
        record.present.insert(chunk);
        record.versions.set(chunk, version.unwrap_or(0));
        self.save_record(name, &record)?;

        trace!(
            "local_cache: wrote {}[{}] at version {:?}",
            name,
            chunk,
            version
        );
        Ok(())
    }

    /// Capture a slot's bytes and version so an unconfirmed write can be
    /// undone
    pub fn snapshot_chunk(&self, name: &str, chunk: ChunkNum) -> Result<SlotSnapshot> {
        let record = self.record(name)?;
        let data = if record.present.contains(&chunk) {
            Some(self.read_chunk_local(name, chunk)?)
        } else {
            None
        };
        Ok(SlotSnapshot {
            data,
            version: record.versions.get(chunk),
        })
    }

    /// Put a slot back the way `snapshot_chunk` found it
    pub fn restore_chunk(
        &self,
        name: &str,
        chunk: ChunkNum,
        snapshot: &SlotSnapshot,
    ) -> Result<()> {
        if let Some(data) = &snapshot.data {
            return self.write_chunk_local(name, chunk, data, Some(snapshot.version));
        }

        self.write_slot(name, chunk, &Chunk::ZERO)?;
        let mut record = self.record(name)?;
        record.present.remove(&chunk);
        record.versions.set(chunk, snapshot.version);
        self.save_record(name, &record)?;

        trace!("local_cache: cleared {}[{}]", name, chunk);
        Ok(())
    }

    /// Write 32 bytes at the slot's offset and flush them to disk
    fn write_slot(&self, name: &str, chunk: ChunkNum, data: &Chunk) -> Result<()> {
        let path = self.mirror_path(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(local_path_error(&path))?;

        file.seek(SeekFrom::Start(chunk.byte_offset()))
            .and_then(|_| file.write_all(data.as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(local_path_error(&path))
    }

    /// Record the version a locally written chunk was committed at
    pub fn set_cached_version(
        &self,
        name: &str,
        chunk: ChunkNum,
        version: ChunkVersion,
    ) -> Result<()> {
        let mut record = self.record(name)?;
        record.versions.set(chunk, version);
        self.save_record(name, &record)
    }

    /// Names of every file mirrored locally
    pub fn list_files(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(local_path_error(&self.root))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(MIRROR_EXT) {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| dfs_core::check_filename(s))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Read the persisted client id
    ///
    /// Returns `None` if no identity was ever assigned. When the id file
    /// is missing an empty one is created for `persist_session_id` to fill.
    pub fn load_or_create_session_id(&self) -> Result<Option<ClientId>> {
        let path = self.root.join(ID_FILE);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!("Created empty identity file {:?}", path);
                return Ok(None);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(local_path_error(&path)(e)),
        }

        let content = fs::read_to_string(&path).map_err(local_path_error(&path))?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        content.parse::<ClientId>().map(Some).map_err(|e| {
            warn!("Identity file {:?} is not a number: {}", path, e);
            DfsError::LocalPath(path.clone())
        })
    }

    /// Persist the client id as decimal text
    pub fn persist_session_id(&self, id: ClientId) -> Result<()> {
        write_atomic(&self.root.join(ID_FILE), id.to_string().as_bytes())
    }
}

/// Write `data` to `path` via a synced temp file and rename
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(local_path_error(&temp_path))?;

        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(local_path_error(&temp_path))?;
    }

    fs::rename(&temp_path, path).map_err(local_path_error(path))?;
    Ok(())
}
