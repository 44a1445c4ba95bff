//! Session start, scheduled events, and teardown.
//!
//! ```text
//!            process()
//!               │
//!               ▼
//!   Starting ──→ secrets ──→ spawn ──→ Active ──→ timers armed
//!      │            │          │
//!      └────────────┴──────────┴──→ rollback, next client
//!
//!   Active ──→ end_session ──→ Ending ──→ stop, release, record ──→ Idle ──→ process()
//! ```
//!
//! Timers never call back into the orchestrator directly. They send a
//! [`SessionEvent`] to the driver task, which re-checks that the session is
//! still the one the event was armed for before acting.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use slotkeeper_invite::{UsageEntry, token_prefix};
use slotkeeper_protocol::{ClientId, EndReason, ErrorCode, ServerMessage, SessionId};
use slotkeeper_session::{ActiveSession, ClientState, Slot};
use slotkeeper_store::{session_key, set_json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::orchestrator::{HandleOf, Running, SessionEvent};
use crate::{
    Orchestrator, OrchestratorError, PlatformReclaimer, ProcessExit, ProcessHandle,
    ProcessSupervisor, SecretLease, SecretVault, SessionBackend, SpawnSpec, collect_secrets,
    platform_label,
};

/// Whether a [`SessionSnapshot`] describes a live or a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Active,
    Ended,
}

/// The record kept under `session:<clientId>` for crash-recovery visibility.
///
/// The in-memory session is authoritative; nothing reads this back while
/// the process is alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_prefix: Option<String>,
    pub platforms: Vec<String>,
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// Sends `event` once `after` has passed, unless `token` is cancelled first.
///
/// The deadline is fixed here, not when the task first runs.
pub(crate) fn spawn_after(
    token: CancellationToken,
    after: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    event: SessionEvent,
) {
    let deadline = Instant::now() + after;
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                let _ = events.send(event);
            }
            () = token.cancelled() => {}
        }
    });
}

impl<B: SessionBackend> Orchestrator<B> {
    /// Starts the session the slot was reserved for.
    ///
    /// The caller has already put the slot in `Starting { client, session_id }`.
    /// On failure the slot is back to `Idle`, the client has been told, and
    /// everything acquired so far has been released.
    pub(crate) async fn start(
        &self,
        client: ClientId,
        session_id: SessionId,
    ) -> Result<(), OrchestratorError> {
        let span = tracing::info_span!(
            "session.start",
            %session_id,
            client_id = %client,
            outcome = tracing::field::Empty,
        );
        let result = self
            .try_start(client, session_id)
            .instrument(span.clone())
            .await;
        span.record("outcome", if result.is_ok() { "started" } else { "failed" });
        if let Err(e) = &result {
            self.rollback_start(client, session_id, e).await;
        }
        result
    }

    async fn try_start(
        &self,
        client: ClientId,
        session_id: SessionId,
    ) -> Result<(), OrchestratorError> {
        let config = &self.inner.config;

        let (ip, user_agent, invite_token, queue_wait) = {
            let mut core = self.inner.core.lock().await;
            let c = core
                .shared
                .client_mut(client)
                .ok_or(OrchestratorError::ClientGone(client))?;
            c.state = ClientState::Active;
            let queue_wait = c.queued_at.take().map(|t| t.elapsed()).unwrap_or_default();
            (c.ip.clone(), c.user_agent.clone(), c.invite_token.clone(), queue_wait)
        };

        let secrets = collect_secrets(&config.platforms, |name| std::env::var(name).ok());
        let lease = self.inner.vault.materialize(session_id, &secrets).await?;

        let spec = SpawnSpec {
            session_id,
            name: format!("slotkeeper-{}", session_id.short()),
            secrets_ref: lease.reference().to_string(),
            env: vec![
                ("SESSION_ID".to_string(), session_id.to_string()),
                ("SKILL_TEST_PLATFORM".to_string(), platform_label(&config.platforms)),
            ],
        };
        let spawned = match self.inner.supervisor.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };
        let handle = Arc::new(spawned.handle);

        let session = {
            let mut guard = self.inner.core.lock().await;
            let core = &mut *guard;
            let reserved = matches!(
                core.shared.slot,
                Slot::Starting { client: c, session_id: s } if c == client && s == session_id
            );
            let credential = core
                .shared
                .client(client)
                .filter(|c| c.is_reachable())
                .and_then(|c| c.credential.clone());
            let (true, Some(credential)) = (reserved, credential) else {
                drop(guard);
                tracing::info!("client left while its session was starting");
                if let Err(e) = handle.kill().await {
                    tracing::warn!(error = %e, "could not kill orphaned session process");
                }
                lease.release().await;
                return Err(OrchestratorError::ClientGone(client));
            };

            if !core.shared.activate_credential(&credential, session_id) {
                tracing::warn!("session credential was not pending");
            }

            let started_at = Utc::now();
            let session = ActiveSession {
                session_id,
                owner: client,
                original_owner: client,
                credential: credential.clone(),
                ip,
                user_agent,
                invite_token,
                started_at,
                expires_at: expiry(started_at, config.session_duration),
                queue_wait,
                platforms: config.platform_names(),
                awaiting_reconnect: false,
                disconnected_at: None,
                errors: Vec::new(),
            };
            core.shared.slot = Slot::Active(session.clone());

            let timers = CancellationToken::new();
            self.arm_timers(session_id, Arc::clone(&handle), timers.clone(), spawned.exited);
            core.running = Some(Running {
                session_id,
                handle,
                lease: Some(lease),
                timers,
                grace: None,
            });

            core.shared.send_to(
                client,
                ServerMessage::SessionStarting {
                    terminal_url: config.terminal_url.clone(),
                    expires_at: session.expires_at,
                    session_token: credential,
                    enabled_platforms: session.platforms.clone(),
                    reconnected: false,
                },
            );
            session
        };

        self.write_snapshot(&session, None, config.session_duration).await;
        self.inner.tally.started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sessions_started_total").increment(1);
        tracing::info!(
            expires_at = %session.expires_at,
            queue_wait_ms = session.queue_wait.as_millis() as u64,
            "session started"
        );
        Ok(())
    }

    /// Frees a slot whose start failed and tells the client.
    async fn rollback_start(&self, client: ClientId, session_id: SessionId, error: &OrchestratorError) {
        let mut core = self.inner.core.lock().await;
        let shared = &mut core.shared;
        if matches!(shared.slot, Slot::Starting { session_id: s, .. } if s == session_id) {
            shared.slot = Slot::Idle;
        }
        if let Some(token) = shared.client_mut(client).and_then(|c| {
            c.state = ClientState::Connected;
            c.queued_at = None;
            c.credential.take()
        }) {
            shared.revoke_credential(&token);
        }
        shared.send_to(
            client,
            ServerMessage::error(
                ErrorCode::SessionStartFailed,
                format!("Your session could not be started: {error}"),
            ),
        );
        metrics::counter!("session_start_failures_total", "code" => error.code().as_str())
            .increment(1);
    }

    /// Schedules the warning, the timeout, the hard kill, and the exit
    /// watch for a freshly started session. All stop when `timers` is
    /// cancelled.
    fn arm_timers(
        &self,
        session_id: SessionId,
        handle: Arc<HandleOf<B>>,
        timers: CancellationToken,
        exited: oneshot::Receiver<ProcessExit>,
    ) {
        let config = &self.inner.config;
        let events = &self.inner.events;

        if let Some(lead) = config.session_duration.checked_sub(config.warning_before) {
            if !lead.is_zero() {
                spawn_after(timers.clone(), lead, events.clone(), SessionEvent::Warning(session_id));
            }
        }
        spawn_after(
            timers.clone(),
            config.session_duration,
            events.clone(),
            SessionEvent::Timeout(session_id),
        );

        let hard_deadline = Instant::now() + config.session_duration + config.hard_timeout_grace;
        let hard_events = events.clone();
        let hard_token = timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(hard_deadline) => {
                    if let Err(e) = handle.kill().await {
                        tracing::warn!(%session_id, error = %e, "hard timeout kill failed");
                    }
                    let _ = hard_events.send(SessionEvent::HardTimeout(session_id));
                }
                () = hard_token.cancelled() => {}
            }
        });

        let exit_events = events.clone();
        tokio::spawn(async move {
            tokio::select! {
                exit = exited => {
                    let exit = exit.unwrap_or(ProcessExit { code: None });
                    let _ = exit_events.send(SessionEvent::Exited(session_id, exit));
                }
                () = timers.cancelled() => {}
            }
        });
    }

    /// Ends session `session_id` if it is the active one.
    ///
    /// Returns `false` if it was not (already ending, already ended, or a
    /// different session), so every trigger can call this without
    /// coordinating with the others.
    pub async fn end_session(&self, session_id: SessionId, reason: EndReason) -> bool {
        let (session, running) = {
            let mut core = self.inner.core.lock().await;
            let core = &mut *core;
            if core.shared.slot.active().is_none_or(|s| s.session_id != session_id) {
                return false;
            }
            let Some((ip, invite_token)) = core
                .shared
                .slot
                .active()
                .map(|s| (s.ip.clone(), s.invite_token.clone()))
            else {
                return false;
            };
            let ending = Slot::Ending {
                session_id,
                ip,
                invite_token,
            };
            let Slot::Active(session) = std::mem::replace(&mut core.shared.slot, ending) else {
                return false;
            };
            core.shared.revoke_credential(&session.credential);
            let running = core.running.take_if(|r| r.session_id == session_id);
            (session, running)
        };

        let span = tracing::info_span!("session.end", %session_id, %reason);
        self.teardown(session, running, reason).instrument(span).await;

        self.process().await;
        true
    }

    async fn teardown(&self, session: ActiveSession, running: Option<Running<B>>, reason: EndReason) {
        let config = &self.inner.config;

        if let Some(running) = running {
            running.timers.cancel();
            if let Some(grace) = running.grace {
                grace.cancel();
            }
            if reason != EndReason::ContainerExit {
                self.stop_process(running.handle.as_ref()).await;
            }
            if let Some(lease) = running.lease {
                lease.release().await;
            }
        }

        let ended_at = Utc::now();
        if let Some(token) = &session.invite_token {
            let entry = UsageEntry {
                session_id: session.session_id.to_string(),
                client_id: session.original_owner.0,
                started_at: session.started_at,
                ended_at,
                end_reason: reason.as_str().to_string(),
                queue_wait_ms: session.queue_wait.as_millis() as u64,
                ip: Some(session.ip.clone()),
                user_agent: session.user_agent.clone(),
                errors: session.errors.clone(),
            };
            self.inner
                .invites
                .record_usage(token, entry, config.audit_retention)
                .await;
        }

        {
            let mut core = self.inner.core.lock().await;
            let shared = &mut core.shared;
            if let Some(c) = shared
                .client_mut(session.owner)
                .filter(|c| c.state == ClientState::Active)
            {
                c.state = ClientState::Connected;
                c.credential = None;
                c.send(ServerMessage::SessionEnded {
                    reason,
                    clear_session_cookie: true,
                });
            }
        }

        self.write_snapshot(&session, Some(reason), config.ended_snapshot_ttl)
            .await;
        for platform in &session.platforms {
            self.inner
                .reclaimer
                .reclaim(platform, session.session_id, reason);
        }

        {
            let mut core = self.inner.core.lock().await;
            if matches!(core.shared.slot, Slot::Ending { session_id, .. } if session_id == session.session_id)
            {
                core.shared.slot = Slot::Idle;
            }
        }

        self.inner.tally.ended.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sessions_ended_total", "reason" => reason.as_str()).increment(1);
        tracing::info!(
            duration_secs = (ended_at - session.started_at).num_seconds(),
            errors = session.errors.len(),
            "session ended"
        );
    }

    /// Terminates gracefully, falling back to a kill if that fails or takes
    /// longer than `hard_timeout_grace`.
    async fn stop_process(&self, handle: &HandleOf<B>) {
        let grace = self.inner.config.hard_timeout_grace;
        match tokio::time::timeout(grace, handle.terminate()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => tracing::warn!(error = %e, "graceful stop failed, killing"),
            Err(_) => tracing::warn!(grace_secs = grace.as_secs(), "graceful stop timed out, killing"),
        }
        if let Err(e) = handle.kill().await {
            tracing::error!(error = %e, "kill failed");
        }
    }

    /// Sends the expiry warning to the session's owner.
    pub(crate) async fn warn_owner(&self, session_id: SessionId) {
        let core = self.inner.core.lock().await;
        let Some(session) = core
            .shared
            .slot
            .active()
            .filter(|s| s.session_id == session_id)
        else {
            return;
        };
        // The warning timer fires exactly `warning_before` ahead of the
        // timeout timer, so that is what remains.
        let minutes_remaining = self.inner.config.warning_before.as_secs().div_ceil(60);
        let delivered = !session.awaiting_reconnect
            && core
                .shared
                .send_to(session.owner, ServerMessage::SessionWarning { minutes_remaining });
        tracing::info!(%session_id, minutes_remaining, delivered, "session expiry warning");
    }

    pub(crate) async fn note_error(&self, session_id: SessionId, error: String) {
        let mut core = self.inner.core.lock().await;
        if let Some(session) = core
            .shared
            .slot
            .active_mut()
            .filter(|s| s.session_id == session_id)
        {
            tracing::warn!(%session_id, %error, "session error");
            session.errors.push(error);
        }
    }

    /// Ends the session if its owner is still away once the grace period
    /// runs out.
    pub(crate) async fn expire_grace(&self, session_id: SessionId) {
        let abandoned = {
            let mut core = self.inner.core.lock().await;
            let core = &mut *core;
            let abandoned = core
                .shared
                .slot
                .active()
                .is_some_and(|s| s.session_id == session_id && s.awaiting_reconnect);
            if let Some(running) = core.running.as_mut().filter(|r| r.session_id == session_id) {
                running.grace = None;
            }
            abandoned
        };
        if abandoned {
            tracing::info!(%session_id, "reconnect grace expired");
            self.end_session(session_id, EndReason::Manual).await;
        }
    }

    /// Writes the session's snapshot under its current owner's key.
    /// Failures are logged; the snapshot is informational.
    pub(crate) async fn write_snapshot(
        &self,
        session: &ActiveSession,
        ended: Option<EndReason>,
        ttl: Duration,
    ) {
        let _ordered = self.inner.snapshots.lock().await;
        self.put_snapshot(session, ended, ttl).await;
    }

    /// [`write_snapshot`](Self::write_snapshot) for a caller already
    /// holding the snapshot ordering lock.
    pub(crate) async fn put_snapshot(
        &self,
        session: &ActiveSession,
        ended: Option<EndReason>,
        ttl: Duration,
    ) {
        let snapshot = SessionSnapshot {
            session_id: session.session_id,
            client_id: session.owner,
            started_at: session.started_at,
            expires_at: session.expires_at,
            invite_prefix: session.invite_token.as_deref().map(token_prefix),
            platforms: session.platforms.clone(),
            status: if ended.is_some() {
                SnapshotStatus::Ended
            } else {
                SnapshotStatus::Active
            },
            end_reason: ended,
        };
        let key = session_key(session.owner.0);
        let ttl = ttl.max(Duration::from_secs(1));
        if let Err(e) = set_json(self.store(), &key, &snapshot, ttl).await {
            tracing::warn!(session_id = %session.session_id, error = %e, "could not write session snapshot");
        }
    }
}

fn expiry(started_at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| started_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
