//! Connection Manager for the coordinating server
//!
//! Owns the client's session with the server and exposes a single
//! connected/disconnected signal. Every request to the server goes through
//! [`ConnectionManager::request`], which is the only place transport
//! failures are observed: any failure there flips the session to
//! disconnected and is reported as `DfsError::Disconnected`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dfs_core::{
    ClientConfig, ClientId, DfsError, Reply, Request, RequestEnvelope, Result, PROTOCOL_VERSION,
};

use crate::local_cache::LocalCacheStore;
use crate::net::{parse_local, resolve, TransportError, UdpTransport};

/// The client's working session with the coordinating server
#[derive(Debug)]
pub struct Session {
    client_id: RwLock<Option<ClientId>>,
    local_ip: String,
    server_addr: String,
    connected: AtomicBool,
}

impl Session {
    fn new(local_ip: &str, server_addr: &str, client_id: Option<ClientId>) -> Self {
        Self {
            client_id: RwLock::new(client_id),
            local_ip: local_ip.to_string(),
            server_addr: server_addr.to_string(),
            connected: AtomicBool::new(false),
        }
    }

    /// Server-assigned id, once a handshake has succeeded
    pub fn client_id(&self) -> Option<ClientId> {
        *self.client_id.read()
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Connection manager for a single coordinating server
pub struct ConnectionManager {
    session: Session,
    transport: Mutex<UdpTransport>,
    store: Arc<LocalCacheStore>,
    next_seq: AtomicU64,
    config: ClientConfig,
}

impl ConnectionManager {
    /// Resolve addresses, bind the local socket, and attempt the identity
    /// handshake
    ///
    /// Address and bind failures are returned as `DfsError::Network`. An
    /// unreachable server is not an error: the manager is returned in the
    /// disconnected state.
    pub async fn connect(
        local_ip: &str,
        server_addr: &str,
        store: Arc<LocalCacheStore>,
        config: ClientConfig,
    ) -> Result<Self> {
        let server = resolve(server_addr).await.map_err(network_error)?;
        let local = parse_local(local_ip).map_err(network_error)?;
        let transport = UdpTransport::bind(local, server)
            .await
            .map_err(network_error)?;

        let prior_id = store.load_or_create_session_id()?;
        let manager = Self {
            session: Session::new(local_ip, server_addr, prior_id),
            transport: Mutex::new(transport),
            store,
            next_seq: AtomicU64::new(1),
            config,
        };

        if let Err(e) = manager.handshake().await {
            warn!(
                "Server {} unreachable at mount ({}); continuing disconnected",
                server_addr, e
            );
        }

        Ok(manager)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Last-known transport health; never touches the network
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn disconnected_error(&self) -> DfsError {
        DfsError::Disconnected(self.session.server_addr.clone())
    }

    /// Treat a reply that breaks the protocol as a lost connection
    pub fn protocol_violation(&self, reason: &str) -> DfsError {
        self.mark_disconnected(reason);
        self.disconnected_error()
    }

    fn mark_connected(&self) {
        if !self.session.connected.swap(true, Ordering::AcqRel) {
            info!(
                "Connected to {} as client {:?}",
                self.session.server_addr,
                self.session.client_id()
            );
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.session.connected.swap(false, Ordering::AcqRel) {
            warn!("Disconnected from {}: {}", self.session.server_addr, reason);
        }
    }

    /// Exchange ids with the server and persist the confirmed one
    async fn handshake(&self) -> Result<ClientId> {
        let prior = self.session.client_id();
        let reply = self
            .exchange(
                Request::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    client_id: prior,
                },
                self.config.connect_timeout(),
            )
            .await?;

        match reply {
            Reply::HelloAck {
                protocol_version,
                client_id,
            } if protocol_version == PROTOCOL_VERSION => {
                if prior != Some(client_id) {
                    self.store.persist_session_id(client_id)?;
                    debug!("Persisted client id {}", client_id);
                }
                *self.session.client_id.write() = Some(client_id);
                self.mark_connected();
                Ok(client_id)
            }
            Reply::HelloAck {
                protocol_version, ..
            } => {
                self.mark_disconnected(&format!(
                    "protocol version mismatch (expected {}, got {})",
                    PROTOCOL_VERSION, protocol_version
                ));
                Err(self.disconnected_error())
            }
            other => {
                self.mark_disconnected(&format!("unexpected reply to hello: {}", other.kind()));
                Err(self.disconnected_error())
            }
        }
    }

    /// One bounded round trip; every failure flips the session offline
    async fn exchange(&self, body: Request, timeout: Duration) -> Result<Reply> {
        let envelope = RequestEnvelope {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            client_id: self.session.client_id(),
            body,
        };

        let result = {
            let transport = self.transport.lock().await;
            transport.round_trip(&envelope, timeout).await
        };

        match result {
            Ok(reply) => match reply.body {
                Reply::Error { code, message } => {
                    self.mark_disconnected(&format!("server error {:?}: {}", code, message));
                    Err(self.disconnected_error())
                }
                body => Ok(body),
            },
            Err(e) => {
                self.mark_disconnected(&e.to_string());
                Err(self.disconnected_error())
            }
        }
    }

    /// Send a request to the server and wait for its reply
    ///
    /// Fails fast with `Disconnected` when the session is already offline.
    pub async fn request(&self, body: Request) -> Result<Reply> {
        if !self.is_connected() {
            return Err(self.disconnected_error());
        }
        self.exchange(body, self.config.request_timeout()).await
    }

    /// Best-effort liveness check
    ///
    /// When connected this pings the server; when disconnected it retries
    /// the identity handshake. Returns the resulting connectivity.
    pub async fn probe(&self) -> bool {
        if self.is_connected() {
            let timestamp = now_millis();
            match self.request(Request::Ping { timestamp }).await {
                Ok(Reply::Pong { .. }) => {}
                Ok(other) => self.mark_disconnected(&format!(
                    "unexpected reply to ping: {}",
                    other.kind()
                )),
                Err(_) => {}
            }
        } else if let Err(e) = self.handshake().await {
            debug!("Reconnect to {} failed: {}", self.session.server_addr, e);
        }
        self.is_connected()
    }

    /// Say goodbye to the server and go offline
    ///
    /// Fails with `Disconnected` if the session is already offline.
    pub async fn close(&self) -> Result<()> {
        let result = self.request(Request::Goodbye).await;
        self.mark_disconnected("session closed");
        match result? {
            Reply::Released => Ok(()),
            other => {
                debug!("Unexpected reply to goodbye: {}", other.kind());
                Ok(())
            }
        }
    }
}

fn network_error(e: TransportError) -> DfsError {
    DfsError::Network(e.to_string())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
