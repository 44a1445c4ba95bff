//! Transport layer for slotkeeper.
//!
//! Provides the [`Transport`], [`Incoming`] and [`Connection`] traits that
//! the server drives, plus [`PeerInfo`]: what we learned about the remote
//! end while upgrading the connection (socket address, proxy headers, user
//! agent). Rate limiting and invite rejoin checks are keyed on
//! [`PeerInfo::client_ip`], so the forwarded-for rules live here, next to
//! the code that reads the headers.
//!
//! Accepting is split in two. [`Transport::accept`] only takes the TCP
//! peer; [`Incoming::upgrade`] runs the handshake, bounded by a timeout, and
//! is meant to run on the connection's own task.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{
    DEFAULT_HANDSHAKE_TIMEOUT, IncomingWebSocket, WebSocketConnection, WebSocketTransport,
};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Whether `X-Forwarded-For` and `X-Real-IP` may name the client.
///
/// Only trust them behind a reverse proxy that overwrites both. Otherwise
/// a client can pick its own address and sidestep every per-IP limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardedHeaders {
    #[default]
    Ignore,
    Trust,
}

impl ForwardedHeaders {
    pub fn from_trust(trust: bool) -> Self {
        if trust { Self::Trust } else { Self::Ignore }
    }
}

/// Metadata about the remote peer, captured during the upgrade handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The TCP peer address (usually the reverse proxy in production).
    pub addr: SocketAddr,
    /// Raw `X-Forwarded-For` header, if the proxy set one.
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header, if the proxy set one.
    pub real_ip: Option<String>,
    /// `User-Agent` header, recorded in invite usage audits.
    pub user_agent: Option<String>,
}

impl PeerInfo {
    /// Peer info for a direct connection with no proxy headers.
    pub fn direct(addr: SocketAddr) -> Self {
        Self {
            addr,
            forwarded_for: None,
            real_ip: None,
            user_agent: None,
        }
    }

    /// Peer info read from request headers through `header`.
    ///
    /// The proxy headers are kept only when `policy` trusts them.
    pub fn from_headers(
        addr: SocketAddr,
        policy: ForwardedHeaders,
        header: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let trusted = |name: &str| match policy {
            ForwardedHeaders::Trust => header(name),
            ForwardedHeaders::Ignore => None,
        };
        Self {
            addr,
            forwarded_for: trusted("x-forwarded-for"),
            real_ip: trusted("x-real-ip"),
            user_agent: header("user-agent"),
        }
    }

    /// The address the client really connected from.
    ///
    /// The left-most `X-Forwarded-For` entry wins, then `X-Real-IP`, then
    /// the socket address. Header values that don't parse as an IP are
    /// ignored rather than trusted verbatim.
    pub fn client_ip(&self) -> IpAddr {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        let real = self
            .real_ip
            .as_deref()
            .and_then(|v| v.trim().parse().ok());
        forwarded.or(real).unwrap_or_else(|| self.addr.ip())
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// A peer that has connected but not finished the handshake.
    type Incoming: Incoming<Connection = Self::Connection, Error = Self::Error>;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for the next peer. Does no protocol work, so a peer that
    /// never speaks cannot hold up the ones behind it.
    async fn accept(&mut self) -> Result<Self::Incoming, Self::Error>;

    /// The address the transport is listening on.
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

/// A connected peer waiting for its handshake.
pub trait Incoming: Send + 'static {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync;

    /// The TCP peer address.
    fn addr(&self) -> SocketAddr;

    /// Completes the handshake, failing if it takes too long.
    async fn upgrade(self) -> Result<Self::Connection, Self::Error>;
}

/// A single connection that can send and receive text frames.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends one text frame to the remote peer.
    async fn send(&self, text: &str) -> Result<(), Self::Error>;

    /// Receives the next data frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection with a status code and reason.
    ///
    /// The reason is cut to fit a WebSocket control frame.
    async fn close(&self, code: u16, reason: &str) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Returns what we know about the remote peer.
    fn peer(&self) -> &PeerInfo;
}

/// Largest close reason that fits in a control frame (125 bytes minus the
/// two-byte status code).
pub const MAX_CLOSE_REASON: usize = 123;

/// Cuts `reason` to at most [`MAX_CLOSE_REASON`] bytes without splitting a
/// UTF-8 character.
pub fn truncate_close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(forwarded: Option<&str>, real: Option<&str>) -> PeerInfo {
        PeerInfo {
            addr: "10.0.0.1:5555".parse().unwrap(),
            forwarded_for: forwarded.map(String::from),
            real_ip: real.map(String::from),
            user_agent: None,
        }
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
        assert_eq!(id.into_inner(), 7);
    }

    #[test]
    fn test_client_ip_without_headers_uses_socket() {
        let p = peer(None, None);
        assert_eq!(p.client_ip().to_string(), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_prefers_leftmost_forwarded_for() {
        let p = peer(Some("203.0.113.9, 10.0.0.1"), Some("198.51.100.2"));
        assert_eq!(p.client_ip().to_string(), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let p = peer(None, Some(" 198.51.100.2 "));
        assert_eq!(p.client_ip().to_string(), "198.51.100.2");
    }

    #[test]
    fn test_client_ip_ignores_garbage_header() {
        let p = peer(Some("not-an-ip"), None);
        assert_eq!(p.client_ip().to_string(), "10.0.0.1");
    }

    fn headers(name: &str) -> Option<String> {
        match name {
            "x-forwarded-for" => Some("203.0.113.9".into()),
            "x-real-ip" => Some("198.51.100.2".into()),
            "user-agent" => Some("curl/8".into()),
            _ => None,
        }
    }

    #[test]
    fn test_from_headers_ignore_drops_proxy_headers() {
        let addr = "10.0.0.1:5555".parse().unwrap();
        let p = PeerInfo::from_headers(addr, ForwardedHeaders::Ignore, headers);

        assert_eq!(p.client_ip().to_string(), "10.0.0.1");
        assert!(p.forwarded_for.is_none());
        assert_eq!(p.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn test_from_headers_trust_keeps_proxy_headers() {
        let addr = "10.0.0.1:5555".parse().unwrap();
        let p = PeerInfo::from_headers(addr, ForwardedHeaders::Trust, headers);

        assert_eq!(p.client_ip().to_string(), "203.0.113.9");
        assert_eq!(p.real_ip.as_deref(), Some("198.51.100.2"));
    }

    #[test]
    fn test_truncate_close_reason_short_is_unchanged() {
        assert_eq!(truncate_close_reason("bye"), "bye");
    }

    #[test]
    fn test_truncate_close_reason_respects_char_boundary() {
        // 'é' is two bytes; 62 of them is 124 bytes, one over the limit.
        let long = "é".repeat(62);
        let cut = truncate_close_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert_eq!(cut.chars().count(), 61);
    }
}
