//! Error types for the protocol layer, and the error taxonomy clients see.
//!
//! Two different things live here:
//!
//! - [`ProtocolError`]: what went wrong turning bytes into messages (or back).
//! - [`ErrorKind`] / [`ErrorCode`]: the stable, machine-readable categories
//!   the server reports to clients. Every failure a client can observe maps
//!   onto exactly one code, and every code onto one HTTP-equivalent status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The bytes were not a valid message: malformed JSON, an unknown
    /// `type`, or a missing field.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message parsed but breaks a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// The five categories of failure a client can be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Missing, invalid or expired session or invite.
    Auth,
    /// Too many attempts; carries a retry-after.
    RateLimit,
    /// Queue full, already queued, or a reconnect already underway.
    Queue,
    /// Spawn or lifecycle failure on our side.
    Session,
}

impl ErrorKind {
    /// The HTTP status this kind maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::RateLimit => 429,
            Self::Queue => 409,
            Self::Session => 500,
        }
    }
}

/// Stable machine-readable error codes, serialized in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidToken,
    Unauthorized,
    SessionExpired,
    RateLimited,
    QueueFull,
    AlreadyQueued,
    ReconnectionInProgress,
    SessionStartFailed,
    Internal,
}

impl ErrorCode {
    /// Which [`ErrorKind`] this code belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMessage | Self::InvalidToken => ErrorKind::Validation,
            Self::Unauthorized | Self::SessionExpired => ErrorKind::Auth,
            Self::RateLimited => ErrorKind::RateLimit,
            Self::QueueFull
            | Self::AlreadyQueued
            | Self::ReconnectionInProgress => ErrorKind::Queue,
            Self::SessionStartFailed | Self::Internal => ErrorKind::Session,
        }
    }

    /// Shorthand for `self.kind().status()`.
    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::QueueFull => "QUEUE_FULL",
            Self::AlreadyQueued => "ALREADY_QUEUED",
            Self::ReconnectionInProgress => "RECONNECTION_IN_PROGRESS",
            Self::SessionStartFailed => "SESSION_START_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_per_kind() {
        assert_eq!(ErrorKind::Validation.status(), 400);
        assert_eq!(ErrorKind::Auth.status(), 401);
        assert_eq!(ErrorKind::RateLimit.status(), 429);
        assert_eq!(ErrorKind::Queue.status(), 409);
        assert_eq!(ErrorKind::Session.status(), 500);
    }

    #[test]
    fn test_reconnection_in_progress_is_a_queue_conflict() {
        assert_eq!(ErrorCode::ReconnectionInProgress.status(), 409);
    }

    #[test]
    fn test_code_serialization_matches_as_str() {
        for code in [
            ErrorCode::InvalidMessage,
            ErrorCode::RateLimited,
            ErrorCode::ReconnectionInProgress,
            ErrorCode::SessionStartFailed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
