//! UDP networking layer
//!
//! Handles address resolution, socket setup, and message framing. Each
//! message is one JSON document in one datagram, read into a fixed-size
//! receive buffer.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use dfs_core::{decode, encode, ProtocolError, ReplyEnvelope, RequestEnvelope, MAX_MESSAGE_SIZE};

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("cannot resolve address {0}")]
    Resolve(String),
    #[error("cannot bind local address {0}: {1}")]
    Bind(String, String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Resolve a `host:port` string to a socket address
pub async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|_| TransportError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(addr.to_string()))
}

/// Parse the local address to bind; accepts `ip` or `ip:port`
pub fn parse_local(local: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = local.parse::<SocketAddr>() {
        return Ok(addr);
    }
    local
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 0))
        .map_err(|_| TransportError::Resolve(local.to_string()))
}

/// Datagram channel to the coordinating server
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket on `local` and associate it with `server`
    pub async fn bind(local: SocketAddr, server: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::Bind(local.to_string(), e.to_string()))?;
        socket
            .connect(server)
            .await
            .map_err(|e| TransportError::Bind(local.to_string(), e.to_string()))?;

        debug!(
            "UDP transport bound on {:?} for server {}",
            socket.local_addr().ok(),
            server
        );
        Ok(Self { socket })
    }

    /// Send one request datagram
    pub async fn send(&self, request: &RequestEnvelope) -> Result<(), TransportError> {
        let data = encode(request)?;
        self.socket
            .send(&data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        trace!("sent seq={} ({} bytes)", request.seq, data.len());
        Ok(())
    }

    /// Receive one reply datagram
    pub async fn recv(&self) -> Result<ReplyEnvelope, TransportError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let n = self
            .socket
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        let reply: ReplyEnvelope = decode(&buf[..n])?;
        trace!("received seq={} {}", reply.seq, reply.body.kind());
        Ok(reply)
    }

    /// Send a request and wait for the reply carrying the same sequence
    /// number, dropping stale replies, all within `timeout`
    pub async fn round_trip(
        &self,
        request: &RequestEnvelope,
        timeout: Duration,
    ) -> Result<ReplyEnvelope, TransportError> {
        let exchange = async {
            self.send(request).await?;
            loop {
                let reply = self.recv().await?;
                if reply.seq == request.seq {
                    return Ok(reply);
                }
                debug!(
                    "Dropping stale reply seq={} (waiting for {})",
                    reply.seq, request.seq
                );
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Protocol(ProtocolError::Timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        assert_eq!(
            parse_local("127.0.0.1").unwrap(),
            "127.0.0.1:0".parse().unwrap()
        );
        assert_eq!(
            parse_local("127.0.0.1:4000").unwrap(),
            "127.0.0.1:4000".parse().unwrap()
        );
        assert!(parse_local("not an ip").is_err());
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        assert!(matches!(
            resolve("no-port-here").await,
            Err(TransportError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_drops_stale_replies() {
        use dfs_core::{Reply, Request};

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let req: RequestEnvelope = decode(&buf[..n]).unwrap();
            for seq in [req.seq - 1, req.seq] {
                let reply = ReplyEnvelope {
                    seq,
                    body: Reply::Pong { timestamp: seq },
                };
                server.send_to(&encode(&reply).unwrap(), from).await.unwrap();
            }
        });

        let request = RequestEnvelope {
            seq: 10,
            client_id: None,
            body: Request::Ping { timestamp: 0 },
        };
        let reply = transport
            .round_trip(&request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.body, Reply::Pong { timestamp: 10 });
    }

    #[tokio::test]
    async fn test_round_trip_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport =
            UdpTransport::bind("127.0.0.1:0".parse().unwrap(), silent.local_addr().unwrap())
                .await
                .unwrap();

        let request = RequestEnvelope {
            seq: 1,
            client_id: None,
            body: dfs_core::Request::Goodbye,
        };
        let result = transport
            .round_trip(&request, Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::Timeout))
        ));
    }
}
