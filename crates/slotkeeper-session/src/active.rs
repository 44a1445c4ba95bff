//! The slot and the single session that may occupy it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use slotkeeper_protocol::{ClientId, SessionId};
use tokio::time::Instant;

/// The live session record.
///
/// At most one exists per process, held inside [`Slot::Active`]. Process
/// handles and materialized secrets are owned by the orchestrator next to
/// it; this is only the bookkeeping.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: SessionId,
    /// The client currently bound to the session. Rebound on reconnect.
    pub owner: ClientId,
    /// The client the session was started for. Never changes.
    pub original_owner: ClientId,
    pub credential: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub invite_token: Option<String>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub queue_wait: Duration,
    pub platforms: Vec<String>,
    /// Set while the owner is disconnected and may still come back.
    pub awaiting_reconnect: bool,
    pub disconnected_at: Option<Instant>,
    /// Non-fatal problems seen during the session, kept for the audit entry.
    pub errors: Vec<String>,
}

impl ActiveSession {
    /// `true` if a request from `ip` with `invite_token` may resume this
    /// session.
    pub fn matches(&self, ip: &str, invite_token: Option<&str>) -> bool {
        self.ip == ip && self.invite_token.as_deref() == invite_token
    }
}

/// Lifecycle phase of the one slot.
///
/// ```text
///   Idle ──→ Starting ──→ Active ──→ Ending ──→ Idle
///               │                                ↑
///               └────────(spawn failure)─────────┘
/// ```
///
/// Only `Idle` means the slot is free. `Starting` and `Ending` keep it
/// occupied while the orchestrator waits on process spawn or teardown.
#[derive(Debug, Default)]
pub enum Slot {
    #[default]
    Idle,
    Starting {
        client: ClientId,
        session_id: SessionId,
    },
    Active(ActiveSession),
    /// Torn down but not yet released. The invite stays claimed until the
    /// usage has been recorded.
    Ending {
        session_id: SessionId,
        ip: String,
        invite_token: Option<String>,
    },
}

impl Slot {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match self {
            Self::Active(session) => Some(session),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveSession> {
        match self {
            Self::Active(session) => Some(session),
            _ => None,
        }
    }

    /// The session id of whatever occupies the slot.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Idle => None,
            Self::Starting { session_id, .. } | Self::Ending { session_id, .. } => {
                Some(*session_id)
            }
            Self::Active(session) => Some(session.session_id),
        }
    }

    /// Short label for logs.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting { .. } => "starting",
            Self::Active(_) => "active",
            Self::Ending { .. } => "ending",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ActiveSession {
        let now = Utc::now();
        ActiveSession {
            session_id: SessionId::new(),
            owner: ClientId(1),
            original_owner: ClientId(1),
            credential: "cred".into(),
            ip: "10.0.0.1".into(),
            user_agent: None,
            invite_token: Some("team-token".into()),
            started_at: now,
            expires_at: now + chrono::Duration::minutes(60),
            queue_wait: Duration::ZERO,
            platforms: Vec::new(),
            awaiting_reconnect: false,
            disconnected_at: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_matches_requires_ip_and_token() {
        let s = session();
        assert!(s.matches("10.0.0.1", Some("team-token")));
        assert!(!s.matches("10.0.0.2", Some("team-token")));
        assert!(!s.matches("10.0.0.1", Some("other")));
        assert!(!s.matches("10.0.0.1", None));
    }

    #[test]
    fn test_slot_phase_and_session_id() {
        let s = session();
        let id = s.session_id;
        let slot = Slot::Active(s);
        assert!(!slot.is_free());
        assert_eq!(slot.phase(), "active");
        assert_eq!(slot.session_id(), Some(id));
        assert!(Slot::Idle.is_free());
        assert_eq!(Slot::Idle.session_id(), None);
    }
}
