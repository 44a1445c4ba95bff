//! Client types: the server's record of one live connection.
//!
//! A "client" exists from the moment a connection passes the connection
//! rate limiter until it closes. It tracks:
//! - WHO it is (`ClientId`) and WHERE it came from (address, user agent)
//! - WHAT it is doing (connected, queued, active)
//! - HOW to reach it (an outbound message channel)
//! - WHICH credential it was issued, if any

use slotkeeper_protocol::{ClientId, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Where a client stands relative to the slot.
///
/// ```text
///   Connected ──(join)──→ Queued ──(promote)──→ Active
///       ↑                   │                     │
///       └──────(leave)──────┘                     │
///       └──────────(session end / start failure)──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected but not waiting for anything.
    Connected,
    /// Waiting in the queue.
    Queued,
    /// Owns the active session.
    Active,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One connected client.
///
/// Messages are pushed through `outbox`, an unbounded channel drained by the
/// connection's writer task. Sending never blocks the caller, and a send to
/// a client whose connection has gone away is silently dropped.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub ip: String,
    pub user_agent: Option<String>,
    pub state: ClientState,
    /// When the client entered the queue. Used for queue-wait accounting.
    pub queued_at: Option<Instant>,
    /// The invite presented with the most recent join, if any.
    pub invite_token: Option<String>,
    /// The session credential issued to this client (pending or active).
    pub credential: Option<String>,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl Client {
    pub fn new(
        id: ClientId,
        ip: impl Into<String>,
        user_agent: Option<String>,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            ip: ip.into(),
            user_agent,
            state: ClientState::Connected,
            queued_at: None,
            invite_token: None,
            credential: None,
            outbox,
        }
    }

    /// Queues a message for this client. Returns `false` if its connection
    /// is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbox.send(msg).is_ok()
    }

    /// Returns `true` while the connection's writer is still listening.
    pub fn is_reachable(&self) -> bool {
        !self.outbox.is_closed()
    }
}
