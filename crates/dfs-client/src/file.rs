//! File Session - per-open-file state machine
//!
//! A [`DfsFile`] is produced by [`crate::Dfs::open`] and enforces the
//! access rules of the mode it was opened with:
//!
//! | state        | read | write | server needed |
//! |--------------|------|-------|---------------|
//! | `OpenRead`   | yes  | no    | yes           |
//! | `OpenWrite`  | yes  | yes   | yes           |
//! | `OpenDread`  | yes  | no    | no            |
//! | `Closed`     | no   | no    | -             |
//!
//! Connected reads reconcile with the server's latest version before
//! serving from the local cache. Writes are made durable locally before
//! they are committed to the server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use dfs_core::{
    chunk_checksum, verify_chunk, Chunk, ChunkNum, DfsError, FileMode, Reply, Request, Result,
};

use crate::connection_manager::ConnectionManager;
use crate::local_cache::{LocalCacheStore, SlotSnapshot};

/// Operations a handle can be asked to perform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// Lifecycle state of an open file handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    OpenRead,
    OpenWrite,
    OpenDread,
    Closed,
}

impl HandleState {
    pub fn from_mode(mode: FileMode) -> Self {
        match mode {
            FileMode::Read => HandleState::OpenRead,
            FileMode::Write => HandleState::OpenWrite,
            FileMode::Dread => HandleState::OpenDread,
        }
    }

    /// Permission table for the closed set of handle states
    pub fn permits(self, op: Op) -> bool {
        matches!(
            (self, op),
            (HandleState::OpenRead, Op::Read)
                | (HandleState::OpenWrite, Op::Read)
                | (HandleState::OpenWrite, Op::Write)
                | (HandleState::OpenDread, Op::Read)
        )
    }
}

/// An open file in the DFS
pub struct DfsFile {
    filename: String,
    mode: FileMode,
    state: HandleState,
    lease_deadline: Option<Instant>,
    conn: Arc<ConnectionManager>,
    store: Arc<LocalCacheStore>,
}

impl DfsFile {
    /// Open `filename` (already validated) in `mode`
    pub(crate) async fn open(
        conn: Arc<ConnectionManager>,
        store: Arc<LocalCacheStore>,
        filename: &str,
        mode: FileMode,
    ) -> Result<Self> {
        let mut lease_deadline = None;

        if mode.requires_server() {
            if !conn.is_connected() {
                return Err(conn.disconnected_error());
            }

            let reply = conn
                .request(Request::Open {
                    filename: filename.to_string(),
                    mode,
                })
                .await?;

            match reply {
                Reply::Opened {
                    ref versions,
                    lease_ms,
                } => {
                    debug!(
                        "Opened {} in {} mode ({} chunks written globally)",
                        filename,
                        mode,
                        versions.written_count()
                    );
                    match (mode, lease_ms) {
                        (FileMode::Write, Some(ms)) => {
                            lease_deadline = Some(Instant::now() + Duration::from_millis(ms));
                        }
                        (FileMode::Write, None) => {
                            return Err(unexpected(&conn, "open without a lease", &reply));
                        }
                        _ => {}
                    }
                }
                Reply::WriteConflict { holder } => {
                    info!(
                        "Write open of {} refused: locked by client {:?}",
                        filename, holder
                    );
                    return Err(DfsError::OpenWriteConflict(filename.to_string()));
                }
                Reply::FileUnavailable => {
                    return Err(DfsError::FileUnavailable(filename.to_string()));
                }
                _ => return Err(unexpected(&conn, "open", &reply)),
            }

            if let Err(e) = store.materialize(filename) {
                if mode == FileMode::Write {
                    let _ = conn
                        .request(Request::ReleaseLock {
                            filename: filename.to_string(),
                        })
                        .await;
                }
                return Err(e);
            }
        } else if !store.file_exists_locally(filename) {
            return Err(DfsError::FileDoesNotExist(filename.to_string()));
        }

        Ok(Self {
            filename: filename.to_string(),
            mode,
            state: HandleState::from_mode(mode),
            lease_deadline,
            conn,
            store,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Time left on the write lease, if this handle holds one
    pub fn lease_remaining(&self) -> Option<Duration> {
        self.lease_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Error for an operation the current state does not permit
    fn refused(&self) -> DfsError {
        if self.state == HandleState::Closed && !self.conn.is_connected() {
            self.conn.disconnected_error()
        } else {
            DfsError::BadFileMode(self.mode)
        }
    }

    /// Read a chunk
    pub async fn read(&mut self, chunk: ChunkNum) -> Result<Chunk> {
        if !self.state.permits(Op::Read) {
            return Err(self.refused());
        }

        if self.state == HandleState::OpenDread {
            return self.store.read_chunk_local(&self.filename, chunk);
        }

        if !self.conn.is_connected() {
            return Err(self.conn.disconnected_error());
        }

        let known_version = self.store.cached_version(&self.filename, chunk)?;
        let reply = self
            .conn
            .request(Request::FetchChunk {
                filename: self.filename.clone(),
                chunk,
                known_version,
            })
            .await?;

        match reply {
            // Never written anywhere: the chunk reads as zeros
            Reply::UpToDate { version: 0 } => Ok(Chunk::ZERO),
            Reply::UpToDate { .. } => self.store.read_chunk_local(&self.filename, chunk),
            Reply::Chunk {
                version,
                data,
                checksum,
            } => {
                if let Err(e) = verify_chunk(&data, &checksum) {
                    warn!("{}[{}] v{} rejected: {}", self.filename, chunk, version, e);
                    return Err(DfsError::ChunkUnavailable(chunk));
                }
                self.store
                    .write_chunk_local(&self.filename, chunk, &data, Some(version))?;
                debug!("Fetched {}[{}] at version {}", self.filename, chunk, version);
                Ok(data)
            }
            Reply::Unavailable { version } => {
                debug!(
                    "{}[{}] v{} has no reachable holder",
                    self.filename, chunk, version
                );
                Err(DfsError::ChunkUnavailable(chunk))
            }
            other => Err(unexpected(&self.conn, "fetch_chunk", &other)),
        }
    }

    /// Write a chunk; only permitted in WRITE mode
    pub async fn write(&mut self, chunk: ChunkNum, data: &Chunk) -> Result<()> {
        if !self.state.permits(Op::Write) {
            return Err(self.refused());
        }

        if !self.conn.is_connected() {
            return Err(self.conn.disconnected_error());
        }

        if self.lease_remaining() == Some(Duration::ZERO) {
            return Err(DfsError::WriteModeTimeout(self.filename.clone()));
        }

        let previous = self.store.snapshot_chunk(&self.filename, chunk)?;
        self.store
            .write_chunk_local(&self.filename, chunk, data, None)?;

        let reply = match self
            .conn
            .request(Request::CommitChunk {
                filename: self.filename.clone(),
                chunk,
                data: *data,
                checksum: chunk_checksum(data),
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.roll_back(chunk, &previous);
                return Err(e);
            }
        };

        match reply {
            Reply::Committed { version, lease_ms } => {
                self.store
                    .set_cached_version(&self.filename, chunk, version)?;
                self.lease_deadline = Some(Instant::now() + Duration::from_millis(lease_ms));
                debug!("Committed {}[{}] at version {}", self.filename, chunk, version);
                Ok(())
            }
            Reply::LeaseExpired => {
                self.roll_back(chunk, &previous);
                self.lease_deadline = Some(Instant::now());
                Err(DfsError::WriteModeTimeout(self.filename.clone()))
            }
            other => {
                self.roll_back(chunk, &previous);
                Err(unexpected(&self.conn, "commit_chunk", &other))
            }
        }
    }

    /// Undo a local write the server never accepted
    fn roll_back(&self, chunk: ChunkNum, previous: &SlotSnapshot) {
        if let Err(e) = self.store.restore_chunk(&self.filename, chunk, previous) {
            warn!(
                "Could not restore {}[{}] after a failed commit: {}",
                self.filename, chunk, e
            );
        }
    }

    /// Close the handle, releasing the write lock if held
    ///
    /// Closing twice is a no-op success while the session is connected.
    pub async fn close(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.state, HandleState::Closed);

        match previous {
            HandleState::Closed => {
                if self.conn.is_connected() {
                    Ok(())
                } else {
                    Err(self.conn.disconnected_error())
                }
            }
            HandleState::OpenWrite => {
                self.lease_deadline = None;
                let reply = self
                    .conn
                    .request(Request::ReleaseLock {
                        filename: self.filename.clone(),
                    })
                    .await?;
                match reply {
                    Reply::Released | Reply::LeaseExpired => {
                        debug!("Released write lock on {}", self.filename);
                        Ok(())
                    }
                    other => Err(unexpected(&self.conn, "release_lock", &other)),
                }
            }
            HandleState::OpenRead | HandleState::OpenDread => Ok(()),
        }
    }
}

impl std::fmt::Debug for DfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfsFile")
            .field("filename", &self.filename)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("lease_remaining", &self.lease_remaining())
            .finish()
    }
}

/// A reply that does not belong to the request is a protocol violation
fn unexpected(conn: &ConnectionManager, request: &str, reply: &Reply) -> DfsError {
    warn!("Unexpected reply to {}: {}", request, reply.kind());
    conn.protocol_violation(&format!("unexpected {} reply to {}", reply.kind(), request))
}
