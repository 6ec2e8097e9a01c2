// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol-aware connection tunnel.
//!
//! A tunnel joins a client connection to a fixed service port inside a
//! machine and then copies raw bytes both ways, below any HTTP framing.
//!
//! Establishment is split in two. [`Tunnel::connect`] resolves the machine
//! and opens the upstream TCP connection; any failure here is still an
//! ordinary HTTP error. The HTTP layer then takes over the client transport
//! with a `101 Switching Protocols` response whose head is the protocol's
//! handshake, and hands both ends to [`bridge`]. After that point failures
//! are only visible as a closed connection and a log line.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;

/// Protocols a tunnel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Remote desktop (VNC).
    Vnc,
    /// Stream ingest (RTMP).
    Rtmp,
    /// Browser debugging (Chrome DevTools Protocol over WebSocket).
    Cdp,
}

impl Protocol {
    /// Well-known service port inside the machine.
    pub fn port(&self) -> u16 {
        match self {
            Protocol::Vnc => 5901,
            Protocol::Rtmp => 1935,
            Protocol::Cdp => 9222,
        }
    }

    /// Name used in requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vnc => "vnc",
            Protocol::Rtmp => "rtmp",
            Protocol::Cdp => "cdp",
        }
    }

    /// Value of the `Upgrade` header in the handshake.
    pub fn upgrade_token(&self) -> &'static str {
        match self {
            Protocol::Cdp => "websocket",
            other => other.as_str(),
        }
    }

    /// The `101 Switching Protocols` response that hands the transport over.
    pub fn switching_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::UPGRADE,
            HeaderValue::from_static(self.upgrade_token()),
        );
        response
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vnc" => Ok(Protocol::Vnc),
            "rtmp" => Ok(Protocol::Rtmp),
            "cdp" => Ok(Protocol::Cdp),
            other => Err(Error::InvalidRequest(format!(
                "unsupported protocol '{}': expected vnc, rtmp or cdp",
                other
            ))),
        }
    }
}

/// Configuration for tunnels.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Upper bound on opening the upstream connection.
    pub connect_timeout: Duration,
    /// Replacement ports per protocol, for environments where machines
    /// expose services elsewhere.
    pub port_overrides: HashMap<Protocol, u16>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            port_overrides: HashMap::new(),
        }
    }
}

/// Opens upstream connections into machines.
#[derive(Clone)]
pub struct Tunnel {
    gateway: Arc<dyn ClusterGateway>,
    config: TunnelConfig,
}

impl Tunnel {
    /// Create a tunnel factory.
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: TunnelConfig) -> Self {
        Self { gateway, config }
    }

    /// Port used for `protocol`.
    pub fn port_for(&self, protocol: Protocol) -> u16 {
        self.config
            .port_overrides
            .get(&protocol)
            .copied()
            .unwrap_or_else(|| protocol.port())
    }

    /// Resolve a machine's service address for `protocol`.
    pub async fn resolve(&self, machine_id: &str, protocol: Protocol) -> Result<SocketAddr> {
        let workload = self
            .gateway
            .find(machine_id)
            .await?
            .ok_or_else(|| Error::MachineNotFound(machine_id.to_string()))?;

        let host = self.gateway.service_host(&workload);
        let port = self.port_for(protocol);
        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Error::Resolution(format!("{}: {}", host, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::Resolution(format!("{}: no addresses", host)))
    }

    /// Open the upstream connection for a tunnel.
    pub async fn connect(&self, machine_id: &str, protocol: Protocol) -> Result<TcpStream> {
        let addr = self.resolve(machine_id, protocol).await?;
        debug!(machine_id = %machine_id, protocol = %protocol, addr = %addr, "Connecting upstream");

        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Connect(format!("{}: {}", addr, e))),
            Err(_) => Err(Error::Connect(format!(
                "{}: timed out after {}s",
                addr,
                self.config.connect_timeout.as_secs()
            ))),
        }
    }
}

/// Direction of a byte copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to machine.
    Inbound,
    /// Machine to client.
    Outbound,
}

/// What ended a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSummary {
    /// Direction whose copy finished first.
    pub closed_by: Direction,
    /// Bytes that direction copied, or `None` if it ended with an error.
    pub bytes: Option<u64>,
}

/// Copy bytes between `client` and `upstream` until either side is done.
///
/// Each direction runs in its own task. Whichever finishes first wins: the
/// other task is aborted and both connections are dropped, so the peer of
/// the still-open side sees the connection close.
pub async fn bridge<C, U>(client: C, upstream: U) -> BridgeSummary
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut inbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });
    let mut outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let (closed_by, finished) = tokio::select! {
        finished = &mut inbound => (Direction::Inbound, finished),
        finished = &mut outbound => (Direction::Outbound, finished),
    };

    let remaining = match closed_by {
        Direction::Inbound => outbound,
        Direction::Outbound => inbound,
    };
    remaining.abort();
    let _ = remaining.await;

    let bytes = match finished {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
            debug!(direction = ?closed_by, error = %e, "Tunnel copy ended with error");
            None
        }
        Err(e) => {
            debug!(direction = ?closed_by, error = %e, "Tunnel copy task failed");
            None
        }
    };

    info!(closed_by = ?closed_by, bytes = ?bytes, "Tunnel closed");
    BridgeSummary { closed_by, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[test]
    fn test_protocol_ports() {
        assert_eq!("vnc".parse::<Protocol>().unwrap().port(), 5901);
        assert_eq!("rtmp".parse::<Protocol>().unwrap().port(), 1935);
        assert_eq!("cdp".parse::<Protocol>().unwrap().port(), 9222);
    }

    #[test]
    fn test_unknown_protocol_is_client_error() {
        let err = "ssh".parse::<Protocol>().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!("VNC".parse::<Protocol>().is_err());
        assert!("".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_switching_response_headers() {
        let response = Protocol::Cdp.switching_response();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
        assert_eq!(response.headers()[header::CONNECTION], "Upgrade");

        let response = Protocol::Vnc.switching_response();
        assert_eq!(response.headers()[header::UPGRADE], "vnc");
    }

    #[test]
    fn test_config_default() {
        let config = TunnelConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert!(config.port_overrides.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_copies_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut machine_peer) = duplex(1024);
        let handle = tokio::spawn(bridge(client, upstream));

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        machine_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        machine_peer.write_all(b"world").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(machine_peer);
        let summary = handle.await.unwrap();
        assert_eq!(summary.closed_by, Direction::Outbound);
        assert_eq!(summary.bytes, Some(5));
    }

    #[tokio::test]
    async fn test_upstream_eof_closes_client() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, machine_peer) = duplex(1024);
        let handle = tokio::spawn(bridge(client, upstream));

        drop(machine_peer);
        let mut buf = Vec::new();
        let read = client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(read, 0);
        assert_eq!(handle.await.unwrap().closed_by, Direction::Outbound);
    }

    #[tokio::test]
    async fn test_client_eof_closes_upstream() {
        let (client, client_peer) = duplex(1024);
        let (upstream, mut machine_peer) = duplex(1024);
        let handle = tokio::spawn(bridge(client, upstream));

        drop(client_peer);
        let mut buf = Vec::new();
        let read = machine_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(read, 0);
        assert_eq!(handle.await.unwrap().closed_by, Direction::Inbound);
    }
}
