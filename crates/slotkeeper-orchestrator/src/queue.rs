//! Queue admission and promotion.
//!
//! ```text
//! join ──→ reconnect? ──yes──→ resume session
//!            │ no
//!            ▼
//!        already queued? ──yes──→ error ALREADY_QUEUED
//!            │ no
//!            ▼
//!        invite ok? ──no──→ invite_invalid
//!            │ yes
//!            ▼
//!        room in queue? ──no──→ queue_full
//!            │ yes
//!            ▼
//!        session_token, then queue_position or (slot free) session_starting
//! ```

use slotkeeper_protocol::{ClientId, ErrorCode, InviteReason, ServerMessage, SessionId};
use slotkeeper_session::{ClientState, Slot, StateError};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::spawn_after;
use crate::orchestrator::{SessionEvent, invite_holders};
use crate::{InviteCheck, JoinOutcome, Orchestrator, SessionBackend};

impl<B: SessionBackend> Orchestrator<B> {
    /// Handles `join_queue` from `client`, optionally carrying an invite.
    pub async fn join(&self, client: ClientId, invite_token: Option<String>) -> JoinOutcome {
        let ip = {
            let core = self.inner.core.lock().await;
            let Some(c) = core.shared.client(client) else {
                return JoinOutcome::UnknownClient;
            };
            if c.state == ClientState::Active {
                c.send(ServerMessage::error(
                    ErrorCode::AlreadyQueued,
                    "You already hold the session.",
                ));
                return JoinOutcome::AlreadyQueued;
            }
            c.ip.clone()
        };

        if let Some(outcome) = self
            .try_reconnect(client, &ip, invite_token.as_deref())
            .await
        {
            return outcome;
        }

        if self.inner.core.lock().await.shared.is_queued(client) {
            self.reply(client, already_queued()).await;
            return JoinOutcome::AlreadyQueued;
        }

        // Uses the invite had left when validated, unless this is a rejoin.
        let mut uses_left = None;
        match invite_token.as_deref() {
            Some(token) => match self.admit_invite(token, &ip).await {
                (InviteCheck::Valid { rejoin }, left) => {
                    if rejoin {
                        tracing::info!(client_id = %client, "joining on rejoin exception");
                    } else {
                        uses_left = Some(left);
                    }
                }
                (InviteCheck::Invalid(reason), _) => {
                    tracing::debug!(client_id = %client, %reason, "invite rejected");
                    self.reply(client, ServerMessage::invite_invalid(reason)).await;
                    return JoinOutcome::InviteInvalid(reason);
                }
                (InviteCheck::RateLimited { retry_after_secs }, _) => {
                    tracing::info!(client_id = %client, %ip, retry_after_secs, "invite attempts rate limited");
                    self.reply(client, ServerMessage::invite_invalid(InviteReason::RateLimited))
                        .await;
                    return JoinOutcome::RateLimited { retry_after_secs };
                }
            },
            None if self.inner.config.require_invite => {
                self.reply(client, ServerMessage::invite_invalid(InviteReason::Missing))
                    .await;
                return JoinOutcome::InviteInvalid(InviteReason::Missing);
            }
            None => {}
        }

        let (position, promote_now) = {
            let mut core = self.inner.core.lock().await;
            let shared = &mut core.shared;
            // Another join on the same invite may have been admitted while
            // this one was being validated.
            if let (Some(left), Some(token)) = (uses_left, invite_token.as_deref()) {
                let held = invite_holders(shared)
                    .iter()
                    .filter(|h| h.invite_token == token)
                    .count();
                if held >= left as usize {
                    tracing::info!(client_id = %client, held, left, "invite claimed concurrently");
                    shared.send_to(client, ServerMessage::invite_invalid(InviteReason::Used));
                    return JoinOutcome::InviteInvalid(InviteReason::Used);
                }
            }
            let position = match shared.enqueue(client) {
                Ok(position) => position,
                Err(StateError::QueueFull { max }) => {
                    tracing::info!(client_id = %client, max, "queue full");
                    shared.send_to(client, ServerMessage::QueueFull);
                    return JoinOutcome::QueueFull;
                }
                Err(StateError::AlreadyQueued(_)) => {
                    shared.send_to(client, already_queued());
                    return JoinOutcome::AlreadyQueued;
                }
                Err(StateError::UnknownClient(_)) => return JoinOutcome::UnknownClient,
            };
            let credential = match shared.issue_pending(client) {
                Ok(token) => token,
                Err(_) => {
                    shared.dequeue(client);
                    return JoinOutcome::UnknownClient;
                }
            };
            if let Some(c) = shared.client_mut(client) {
                c.invite_token = invite_token;
            }
            shared.send_to(
                client,
                ServerMessage::SessionToken {
                    session_token: credential,
                },
            );
            tracing::info!(client_id = %client, position, "client queued");
            (position, shared.slot.is_free())
        };

        if promote_now {
            self.process().await;
            let core = self.inner.core.lock().await;
            let shared = &core.shared;
            if shared.slot.active().is_some_and(|s| s.owner == client) {
                return JoinOutcome::Started;
            }
            match shared.position(client) {
                Some(position) => {
                    shared.send_to(client, self.position_message(position, shared.queue_len()));
                    JoinOutcome::Queued { position }
                }
                None => JoinOutcome::StartFailed,
            }
        } else {
            let core = self.inner.core.lock().await;
            let shared = &core.shared;
            shared.send_to(client, self.position_message(position, shared.queue_len()));
            JoinOutcome::Queued { position }
        }
    }

    /// Handles `leave_queue`.
    ///
    /// From a queued client this drops its entry. From the session owner it
    /// ends the session with reason `manual`.
    pub async fn leave(&self, client: ClientId) {
        enum Action {
            End(SessionId),
            Left,
            Nothing,
        }

        let action = {
            let mut core = self.inner.core.lock().await;
            let shared = &mut core.shared;
            if let Some(session) = shared.slot.active().filter(|s| s.owner == client) {
                Action::End(session.session_id)
            } else if shared.dequeue(client) {
                if let Some(token) = shared.client_mut(client).and_then(|c| c.credential.take()) {
                    shared.revoke_credential(&token);
                }
                shared.send_to(client, ServerMessage::LeftQueue);
                tracing::info!(client_id = %client, "client left queue");
                Action::Left
            } else {
                shared.send_to(client, ServerMessage::LeftQueue);
                Action::Nothing
            }
        };

        match action {
            Action::End(session_id) => {
                tracing::info!(client_id = %client, %session_id, "owner left, ending session");
                self.end_session(session_id, slotkeeper_protocol::EndReason::Manual)
                    .await;
            }
            Action::Left => self.broadcast_positions().await,
            Action::Nothing => {}
        }
    }

    /// Handles `heartbeat`.
    pub async fn heartbeat(&self, client: ClientId) {
        let core = self.inner.core.lock().await;
        if let Some(c) = core.shared.client(client) {
            c.send(ServerMessage::HeartbeatAck {
                server_time: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    /// Handles a closed connection.
    ///
    /// A queued client's entry stays in the queue until promotion reaches
    /// it. A session owner gets `reconnect_grace` to come back before the
    /// session is ended.
    pub async fn disconnect(&self, client: ClientId) {
        enum Action {
            Advance,
            EndNow(SessionId),
            Nothing,
        }

        let action = {
            let mut core = self.inner.core.lock().await;
            let core = &mut *core;
            let Some(departed) = core.shared.unregister(client) else {
                return;
            };
            match departed.state {
                ClientState::Queued => {
                    tracing::debug!(client_id = %client, "queued client disconnected");
                    Action::Advance
                }
                ClientState::Active => match core.shared.slot.active_mut() {
                    Some(session) if session.owner == client => {
                        session.awaiting_reconnect = true;
                        session.disconnected_at = Some(tokio::time::Instant::now());
                        let session_id = session.session_id;
                        let grace = self.inner.config.reconnect_grace;
                        tracing::info!(
                            client_id = %client,
                            %session_id,
                            grace_secs = grace.as_secs(),
                            "session owner disconnected"
                        );
                        if grace.is_zero() {
                            Action::EndNow(session_id)
                        } else {
                            let token = CancellationToken::new();
                            if let Some(running) = core
                                .running
                                .as_mut()
                                .filter(|r| r.session_id == session_id)
                            {
                                if let Some(old) = running.grace.replace(token.clone()) {
                                    old.cancel();
                                }
                            }
                            spawn_after(
                                token,
                                grace,
                                self.inner.events.clone(),
                                SessionEvent::GraceExpired(session_id),
                            );
                            Action::Nothing
                        }
                    }
                    _ => Action::Nothing,
                },
                ClientState::Connected => Action::Nothing,
            }
        };

        match action {
            Action::Advance => self.process().await,
            Action::EndNow(session_id) => {
                self.end_session(session_id, slotkeeper_protocol::EndReason::Manual)
                    .await;
            }
            Action::Nothing => {}
        }
    }

    /// Sends every connected queued client its current position.
    pub async fn broadcast_positions(&self) {
        let core = self.inner.core.lock().await;
        let shared = &core.shared;
        let size = shared.queue_len();
        for (client, position) in shared.live_positions() {
            shared.send_to(client, self.position_message(position, size));
        }
    }

    /// Advances the queue if the slot is free.
    ///
    /// Pops the head; if that client has gone, discards it and tries the
    /// next. Stops once a session starts or the queue runs out. A failed
    /// start releases the slot and moves on to the next client.
    pub async fn process(&self) {
        let mut advanced = false;
        loop {
            let (client, session_id) = {
                let mut core = self.inner.core.lock().await;
                let shared = &mut core.shared;
                if !shared.slot.is_free() {
                    break;
                }
                let Some(head) = shared.pop_head() else {
                    break;
                };
                advanced = true;
                if !shared.client(head).is_some_and(|c| c.is_reachable()) {
                    tracing::debug!(client_id = %head, "skipping departed queue entry");
                    continue;
                }
                let session_id = SessionId::new();
                shared.slot = Slot::Starting {
                    client: head,
                    session_id,
                };
                (head, session_id)
            };

            match self.start(client, session_id).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(client_id = %client, %session_id, error = %e, "session start failed");
                }
            }
        }

        if advanced {
            self.broadcast_positions().await;
        }
    }

    pub(crate) async fn reply(&self, client: ClientId, msg: ServerMessage) {
        self.inner.core.lock().await.shared.send_to(client, msg);
    }

    fn position_message(&self, position: usize, queue_size: usize) -> ServerMessage {
        ServerMessage::QueuePosition {
            position,
            queue_size,
            estimated_wait: self.inner.config.estimated_wait(position),
        }
    }
}

fn already_queued() -> ServerMessage {
    ServerMessage::error(ErrorCode::AlreadyQueued, "You are already in the queue.")
}
