//! Resuming a session after its owner's connection dropped.
//!
//! When the session owner disconnects, the session is flagged
//! `awaiting_reconnect` and a grace timer starts. A `join_queue` from the
//! same address with the same invite during that window resumes the
//! session instead of queueing.
//!
//! Two tabs can race here. The [`ReconnectLock`](slotkeeper_session::ReconnectLock)
//! is taken before the session is touched and held until it has been
//! rebound and its snapshot rewritten. A second attempt that arrives
//! meanwhile is told `RECONNECTION_IN_PROGRESS`, even once the first has
//! already cleared `awaiting_reconnect`.
//!
//! The snapshot is written after the rebind commits. Its ordering slot is
//! taken while the core lock is still held, so an `ended` snapshot from a
//! teardown that starts afterwards always lands on top of it.

use chrono::Utc;
use slotkeeper_protocol::{ClientId, ErrorCode, ServerMessage};
use slotkeeper_session::ClientState;

use crate::{JoinOutcome, Orchestrator, SessionBackend};

impl<B: SessionBackend> Orchestrator<B> {
    /// Resumes the awaiting session if `ip` and `invite_token` own it.
    ///
    /// `None` means resumption does not apply and the join should proceed
    /// normally.
    pub(crate) async fn try_reconnect(
        &self,
        client: ClientId,
        ip: &str,
        invite_token: Option<&str>,
    ) -> Option<JoinOutcome> {
        let mut session = {
            let core = self.inner.core.lock().await;
            let session = core.shared.slot.active()?;
            if !session.matches(ip, invite_token) {
                return None;
            }
            if !session.awaiting_reconnect && !self.inner.reconnect_lock.is_held() {
                return None;
            }
            session.clone()
        };

        let Some(_guard) = self.inner.reconnect_lock.try_acquire() else {
            tracing::info!(client_id = %client, session_id = %session.session_id, "reconnection already in progress");
            self.reply(
                client,
                ServerMessage::error(
                    ErrorCode::ReconnectionInProgress,
                    "Another connection is already resuming this session.",
                ),
            )
            .await;
            return Some(JoinOutcome::ReconnectionInProgress);
        };

        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let reachable = core
            .shared
            .client(client)
            .is_some_and(|c| c.is_reachable());
        let live = core
            .shared
            .slot
            .active_mut()
            .filter(|s| s.session_id == session.session_id && s.awaiting_reconnect);
        let (Some(live), true) = (live, reachable) else {
            tracing::debug!(client_id = %client, "session gone before reconnection completed");
            return None;
        };

        let previous = live.owner;
        let away = live.disconnected_at.take().map(|at| at.elapsed());
        live.owner = client;
        live.awaiting_reconnect = false;
        session = live.clone();
        let reply = ServerMessage::SessionStarting {
            terminal_url: self.inner.config.terminal_url.clone(),
            expires_at: live.expires_at,
            session_token: live.credential.clone(),
            enabled_platforms: live.platforms.clone(),
            reconnected: true,
        };
        let credential = live.credential.clone();

        if let Some(grace) = core.running.as_mut().and_then(|r| r.grace.take()) {
            grace.cancel();
        }
        if let Some(c) = core.shared.client_mut(client) {
            c.state = ClientState::Active;
            c.credential = Some(credential);
            c.invite_token = invite_token.map(str::to_string);
        }
        core.shared.send_to(client, reply);

        let ordered = self.inner.snapshots.lock().await;
        drop(guard);
        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        self.put_snapshot(&session, None, remaining).await;
        drop(ordered);

        tracing::info!(
            client_id = %client,
            previous_client = %previous,
            session_id = %session.session_id,
            away_ms = away.map(|d| d.as_millis() as u64),
            "session resumed"
        );
        Some(JoinOutcome::Reconnected)
    }
}
