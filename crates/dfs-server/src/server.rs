//! UDP coordinating server
//!
//! Requests are handled one datagram at a time, which serializes write
//! lock acquisition and version increments across every client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dfs_core::{
    check_filename, decode, encode, verify_chunk, ChunkNum, ClientId, ErrorCode, FileMode, Reply,
    ReplyEnvelope, Request, RequestEnvelope, ServerConfig, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

use crate::file_table::{ChunkLookup, FileTable};
use crate::lock_manager::{LockError, LockManager};

/// How often expired leases are swept
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A client known to the server
#[derive(Clone, Debug)]
pub struct ClientInfo {
    /// Address the client last spoke from
    pub addr: SocketAddr,
}

/// Shared state of the coordinating server
pub struct Coordinator {
    files: FileTable,
    locks: LockManager,
    clients: DashMap<ClientId, ClientInfo>,
    next_client_id: AtomicU64,
}

impl Coordinator {
    pub fn new(lease: Duration) -> Self {
        Self {
            files: FileTable::new(),
            locks: LockManager::new(lease),
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle one request from `from`
    pub fn handle(&self, envelope: RequestEnvelope, from: SocketAddr) -> ReplyEnvelope {
        let seq = envelope.seq;
        let body = match envelope.body {
            Request::Hello {
                protocol_version,
                client_id,
            } => self.hello(protocol_version, client_id, from),
            body => match envelope.client_id {
                Some(id) if self.touch(id, from) => self.dispatch(id, body),
                other => {
                    debug!("Request from unknown client {:?} at {}", other, from);
                    Reply::error(ErrorCode::UnknownClient, "hello required")
                }
            },
        };
        ReplyEnvelope { seq, body }
    }

    fn hello(
        &self,
        protocol_version: u32,
        prior: Option<ClientId>,
        from: SocketAddr,
    ) -> Reply {
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Client at {} speaks protocol {} (expected {})",
                from, protocol_version, PROTOCOL_VERSION
            );
            return Reply::HelloAck {
                protocol_version: PROTOCOL_VERSION,
                client_id: 0,
            };
        }

        let client_id = match prior {
            Some(id) if id > 0 => {
                // Never hand this id out to somebody else
                self.next_client_id.fetch_max(id + 1, Ordering::AcqRel);
                id
            }
            _ => self.next_client_id.fetch_add(1, Ordering::AcqRel),
        };

        self.clients.insert(client_id, ClientInfo { addr: from });
        info!(
            "Client {} {} from {} ({} known)",
            client_id,
            if prior == Some(client_id) { "resumed" } else { "joined" },
            from,
            self.client_count()
        );

        Reply::HelloAck {
            protocol_version: PROTOCOL_VERSION,
            client_id,
        }
    }

    /// Record a known client's current address; false if the id is unknown
    fn touch(&self, id: ClientId, from: SocketAddr) -> bool {
        match self.clients.get_mut(&id) {
            Some(mut info) => {
                if info.addr != from {
                    debug!("Client {} moved from {} to {}", id, info.addr, from);
                    info.addr = from;
                }
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, client: ClientId, body: Request) -> Reply {
        match body {
            Request::Hello { .. } => Reply::error(ErrorCode::ProtocolError, "duplicate hello"),
            Request::Ping { timestamp } => Reply::Pong { timestamp },
            Request::Exists { filename } => match bad_filename(&filename) {
                Some(err) => err,
                None => Reply::Exists {
                    exists: self.files.exists(&filename),
                },
            },
            Request::Open { filename, mode } => self.open(client, filename, mode),
            Request::FetchChunk {
                filename,
                chunk,
                known_version,
            } => self.fetch(filename, chunk, known_version),
            Request::CommitChunk {
                filename,
                chunk,
                data,
                checksum,
            } => {
                if verify_chunk(&data, &checksum).is_err() {
                    return Reply::error(ErrorCode::ProtocolError, "chunk checksum mismatch");
                }
                self.commit(client, filename, chunk, data)
            }
            Request::ReleaseLock { filename } => match self.locks.release(&filename, client) {
                Ok(()) => Reply::Released,
                Err(_) => Reply::LeaseExpired,
            },
            Request::Goodbye => {
                self.locks.release_all_by_holder(client);
                if let Some((_, gone)) = self.clients.remove(&client) {
                    info!("Client {} at {} left", client, gone.addr);
                }
                Reply::Released
            }
        }
    }

    fn open(&self, client: ClientId, filename: String, mode: FileMode) -> Reply {
        if let Some(err) = bad_filename(&filename) {
            return err;
        }
        if mode == FileMode::Dread {
            return Reply::error(ErrorCode::ProtocolError, "DREAD opens are local only");
        }

        let record = self.files.get_or_create(&filename);
        if !record.fully_available() {
            return Reply::FileUnavailable;
        }

        let lease_ms = if mode == FileMode::Write {
            match self.locks.acquire(&filename, client) {
                Ok(hold) => Some(
                    hold.expires_at
                        .saturating_duration_since(hold.acquired_at)
                        .as_millis() as u64,
                ),
                Err(LockError::Conflict { holder, .. }) => {
                    return Reply::WriteConflict {
                        holder: Some(holder),
                    }
                }
                Err(LockError::NotHeld) => return Reply::WriteConflict { holder: None },
            }
        } else {
            None
        };

        debug!("Client {} opened {} in {} mode", client, filename, mode);
        Reply::Opened {
            versions: record.versions,
            lease_ms,
        }
    }

    fn fetch(&self, filename: String, chunk: ChunkNum, known_version: u64) -> Reply {
        match self.files.lookup(&filename, chunk, known_version) {
            Some(ChunkLookup::UpToDate(version)) => Reply::UpToDate { version },
            Some(ChunkLookup::Fetched(data, version)) => Reply::Chunk {
                version,
                checksum: dfs_core::chunk_checksum(&data),
                data,
            },
            Some(ChunkLookup::Unavailable(version)) => Reply::Unavailable { version },
            None => Reply::error(ErrorCode::FileNotFound, format!("no such file: {}", filename)),
        }
    }

    fn commit(
        &self,
        client: ClientId,
        filename: String,
        chunk: ChunkNum,
        data: dfs_core::Chunk,
    ) -> Reply {
        // Renewing first both checks the lease and restarts its clock
        match self.locks.renew(&filename, client) {
            Ok(_) => {
                let version = self.files.commit(&filename, chunk, data, client);
                Reply::Committed {
                    version,
                    lease_ms: self.locks.lease().as_millis() as u64,
                }
            }
            Err(_) => {
                debug!(
                    "Commit of {}[{}] by client {} rejected: lease expired",
                    filename, chunk, client
                );
                Reply::LeaseExpired
            }
        }
    }
}

fn bad_filename(filename: &str) -> Option<Reply> {
    if check_filename(filename) {
        None
    } else {
        Some(Reply::error(
            ErrorCode::BadFilename,
            format!("bad filename: {}", filename),
        ))
    }
}

/// The coordinating server bound to a UDP socket
pub struct CoordinatingServer {
    socket: UdpSocket,
    state: Arc<Coordinator>,
}

impl CoordinatingServer {
    /// Bind using the address and lease from `config`
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(config.bind, config.port);
        Self::bind_addr(addr, config.lease()).await
    }

    pub async fn bind_addr(addr: SocketAddr, lease: Duration) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr, e))?;
        Ok(Self {
            socket,
            state: Arc::new(Coordinator::new(lease)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> Arc<Coordinator> {
        self.state.clone()
    }

    /// Serve requests until the socket fails
    pub async fn serve(self) -> Result<(), ServerError> {
        info!("Coordinating server listening on {}", self.local_addr()?);

        let state = self.state.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                state.locks().cleanup_expired();
            }
        });

        let result = self.receive_loop().await;
        sweeper.abort();
        result
    }

    async fn receive_loop(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP port-unreachable from a departed client surfaces here
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            let envelope: RequestEnvelope = match decode(&buf[..n]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            let reply = self.state.handle(envelope, from);
            match encode(&reply) {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, from).await {
                        debug!("Reply to {} failed: {}", from, e);
                    }
                }
                Err(e) => warn!("Failed to encode reply for {}: {}", from, e),
            }
        }
    }

    /// Run the server on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<Result<(), ServerError>> {
        tokio::spawn(self.serve())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_core::{chunk_checksum, Chunk};

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn call(c: &Coordinator, client_id: Option<ClientId>, body: Request) -> Reply {
        c.handle(
            RequestEnvelope {
                seq: 1,
                client_id,
                body,
            },
            addr(),
        )
        .body
    }

    fn join(c: &Coordinator, prior: Option<ClientId>) -> ClientId {
        match call(
            c,
            None,
            Request::Hello {
                protocol_version: PROTOCOL_VERSION,
                client_id: prior,
            },
        ) {
            Reply::HelloAck { client_id, .. } => client_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn open(c: &Coordinator, id: ClientId, name: &str, mode: FileMode) -> Reply {
        call(
            c,
            Some(id),
            Request::Open {
                filename: name.into(),
                mode,
            },
        )
    }

    fn commit(c: &Coordinator, id: ClientId, name: &str, chunk: u8, data: Chunk) -> Reply {
        call(
            c,
            Some(id),
            Request::CommitChunk {
                filename: name.into(),
                chunk: ChunkNum::new(chunk),
                checksum: chunk_checksum(&data),
                data,
            },
        )
    }

    #[test]
    fn test_id_allocation_and_resume() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        let b = join(&c, None);
        assert_ne!(a, b);

        assert_eq!(join(&c, Some(40)), 40);
        assert!(join(&c, None) > 40);
        assert_eq!(c.client_count(), 4);
    }

    #[test]
    fn test_client_address_follows_requests() {
        let c = Coordinator::new(Duration::from_secs(30));
        let id = join(&c, None);
        let moved: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        let reply = c
            .handle(
                RequestEnvelope {
                    seq: 2,
                    client_id: Some(id),
                    body: Request::Ping { timestamp: 3 },
                },
                moved,
            )
            .body;
        assert_eq!(reply, Reply::Pong { timestamp: 3 });
        assert_eq!(c.clients.get(&id).unwrap().addr, moved);
    }

    #[test]
    fn test_unknown_client_rejected() {
        let c = Coordinator::new(Duration::from_secs(30));
        assert!(matches!(
            call(&c, Some(99), Request::Ping { timestamp: 1 }),
            Reply::Error {
                code: ErrorCode::UnknownClient,
                ..
            }
        ));
        assert!(matches!(
            call(&c, None, Request::Ping { timestamp: 1 }),
            Reply::Error { .. }
        ));
    }

    #[test]
    fn test_open_creates_file() {
        let c = Coordinator::new(Duration::from_secs(30));
        let id = join(&c, None);

        assert_eq!(
            call(&c, Some(id), Request::Exists { filename: "abc".into() }),
            Reply::Exists { exists: false }
        );
        assert!(matches!(
            open(&c, id, "abc", FileMode::Read),
            Reply::Opened { lease_ms: None, .. }
        ));
        assert_eq!(
            call(&c, Some(id), Request::Exists { filename: "abc".into() }),
            Reply::Exists { exists: true }
        );
    }

    #[test]
    fn test_write_conflict_and_release() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        let b = join(&c, None);

        assert!(matches!(
            open(&c, a, "abc", FileMode::Write),
            Reply::Opened { lease_ms: Some(30_000), .. }
        ));
        assert_eq!(
            open(&c, b, "abc", FileMode::Write),
            Reply::WriteConflict { holder: Some(a) }
        );
        // Readers are never blocked by the writer
        assert!(matches!(
            open(&c, b, "abc", FileMode::Read),
            Reply::Opened { .. }
        ));

        assert_eq!(
            call(&c, Some(a), Request::ReleaseLock { filename: "abc".into() }),
            Reply::Released
        );
        assert!(matches!(
            open(&c, b, "abc", FileMode::Write),
            Reply::Opened { .. }
        ));
    }

    #[test]
    fn test_commit_requires_lease() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        let b = join(&c, None);
        open(&c, a, "abc", FileMode::Write);
        open(&c, b, "abc", FileMode::Read);

        assert_eq!(commit(&c, b, "abc", 0, Chunk::ZERO), Reply::LeaseExpired);
        assert_eq!(
            commit(&c, a, "abc", 0, Chunk::new([1; 32])),
            Reply::Committed {
                version: 1,
                lease_ms: 30_000
            }
        );
    }

    #[test]
    fn test_commit_bad_checksum() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        open(&c, a, "abc", FileMode::Write);

        let reply = call(
            &c,
            Some(a),
            Request::CommitChunk {
                filename: "abc".into(),
                chunk: ChunkNum::new(0),
                data: Chunk::new([1; 32]),
                checksum: chunk_checksum(&Chunk::ZERO),
            },
        );
        assert!(matches!(reply, Reply::Error { code: ErrorCode::ProtocolError, .. }));
        assert_eq!(c.files().versions("abc").unwrap().get(ChunkNum::new(0)), 0);
    }

    #[test]
    fn test_fetch_after_commit() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        open(&c, a, "abc", FileMode::Write);
        let data = Chunk::new([5; 32]);
        commit(&c, a, "abc", 5, data);

        let fetch = |known| {
            call(
                &c,
                Some(a),
                Request::FetchChunk {
                    filename: "abc".into(),
                    chunk: ChunkNum::new(5),
                    known_version: known,
                },
            )
        };
        assert_eq!(
            fetch(0),
            Reply::Chunk {
                version: 1,
                data,
                checksum: chunk_checksum(&data)
            }
        );
        assert_eq!(fetch(1), Reply::UpToDate { version: 1 });
    }

    #[test]
    fn test_goodbye_releases_locks() {
        let c = Coordinator::new(Duration::from_secs(30));
        let a = join(&c, None);
        let b = join(&c, None);
        open(&c, a, "abc", FileMode::Write);

        assert_eq!(call(&c, Some(a), Request::Goodbye), Reply::Released);
        assert!(matches!(
            open(&c, b, "abc", FileMode::Write),
            Reply::Opened { .. }
        ));
        assert!(matches!(
            call(&c, Some(a), Request::Ping { timestamp: 0 }),
            Reply::Error { code: ErrorCode::UnknownClient, .. }
        ));
    }

    #[test]
    fn test_expired_lease_lets_next_writer_in() {
        let c = Coordinator::new(Duration::from_millis(20));
        let a = join(&c, None);
        let b = join(&c, None);
        open(&c, a, "abc", FileMode::Write);

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(commit(&c, a, "abc", 0, Chunk::ZERO), Reply::LeaseExpired);
        assert!(matches!(
            open(&c, b, "abc", FileMode::Write),
            Reply::Opened { .. }
        ));
    }
}
