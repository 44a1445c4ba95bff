//! Wire types for the slotkeeper WebSocket protocol.
//!
//! Every message is a JSON object with a `type` field naming the variant,
//! e.g. `{"type":"queue_position","position":2,"queue_size":3,"estimated_wait":120}`.
//! Browsers speak this format directly, so the field names here are part of
//! the public contract: renaming one breaks every deployed client.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ErrorCode;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies one connected client (one WebSocket, not one person).
///
/// Newtype over `u64` so it can't be confused with other counters.
/// Serializes as a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// Identifies one terminal session from spawn to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// A fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in container names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enumerations that travel on the wire
// ---------------------------------------------------------------------------

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The configured session duration elapsed.
    Timeout,
    /// The sandboxed process exited on its own.
    ContainerExit,
    /// The owner asked to stop, or abandoned the session past the grace period.
    Manual,
    /// Something in the lifecycle failed.
    Error,
}

impl EndReason {
    /// Stable lowercase name, as used in metrics labels and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ContainerExit => "container_exit",
            Self::Manual => "manual",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an invite token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteReason {
    /// Syntactically malformed; the store was never consulted.
    Invalid,
    /// No record for this token.
    NotFound,
    /// An operator revoked it.
    Revoked,
    /// Its usage quota is exhausted.
    Used,
    /// Past its expiry timestamp.
    Expired,
    /// The server requires an invite and none was sent.
    Missing,
    /// Too many failed attempts from this address.
    RateLimited,
    /// The store could not be reached.
    Unavailable,
}

impl InviteReason {
    /// Stable lowercase name, as used in metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::NotFound => "not_found",
            Self::Revoked => "revoked",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::Missing => "missing",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
        }
    }

    /// Human-readable explanation shown by the client.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Invalid => "This invite link is malformed.",
            Self::NotFound => "This invite link is not recognised.",
            Self::Revoked => "This invite has been revoked.",
            Self::Used => "This invite has already been used.",
            Self::Expired => "This invite has expired.",
            Self::Missing => "An invite is required to join the queue.",
            Self::RateLimited => {
                "Too many invalid invite attempts. Please try again later."
            }
            Self::Unavailable => {
                "Invites cannot be checked right now. Please try again shortly."
            }
        }
    }
}

impl fmt::Display for InviteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Messages a browser sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a place in the queue, optionally presenting an invite.
    JoinQueue {
        #[serde(rename = "inviteToken", default, skip_serializing_if = "Option::is_none")]
        invite_token: Option<String>,
    },
    /// Give up a place in the queue (or end one's own session).
    LeaveQueue,
    /// Keep-alive.
    Heartbeat,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Messages the server sends to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The credential issued on queue join. The browser trades it for a
    /// cookie via `POST /api/session/cookie`.
    SessionToken { session_token: String },

    /// Where the client stands in the queue. `estimated_wait` is in minutes.
    QueuePosition {
        position: usize,
        queue_size: usize,
        estimated_wait: u64,
    },

    /// The queue is at capacity; nothing was changed.
    QueueFull,

    /// Confirmation of `leave_queue`.
    LeftQueue,

    /// The invite was refused.
    InviteInvalid {
        reason: InviteReason,
        message: String,
    },

    /// The terminal is ready (or, with `reconnected`, ready again).
    SessionStarting {
        terminal_url: String,
        expires_at: DateTime<Utc>,
        session_token: String,
        enabled_platforms: Vec<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reconnected: bool,
    },

    /// The session is about to expire.
    SessionWarning { minutes_remaining: u64 },

    /// The session is over.
    SessionEnded {
        reason: EndReason,
        clear_session_cookie: bool,
    },

    /// Reply to `heartbeat`, carrying the server's wall clock in ms.
    HeartbeatAck { server_time: i64 },

    /// A structured failure.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    /// Convenience constructor for [`ServerMessage::Error`] without details.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Convenience constructor for [`ServerMessage::InviteInvalid`].
    pub fn invite_invalid(reason: InviteReason) -> Self {
        Self::InviteInvalid {
            reason,
            message: reason.message().to_string(),
        }
    }
}
