//! The orchestrator: one handle onto the shared state and collaborators.
//!
//! `Orchestrator<B>` is a cheap-to-clone handle (an `Arc` inside). The
//! connection handler calls into it for every client message; timers and
//! process-exit watchers report back through an internal event channel
//! drained by a driver task.
//!
//! The work is split across modules by concern, each adding an `impl`
//! block:
//!
//! - [`queue`](crate::queue): join, leave, heartbeat, disconnect, promotion
//! - [`reconnect`](crate::reconnect): resuming a session after a disconnect
//! - [`lifecycle`](crate::lifecycle): start, timers, and teardown
//!
//! # Locking
//!
//! All bookkeeping lives in one `tokio::sync::Mutex<Core>`. It is not
//! held across calls to collaborators: each operation takes the lock,
//! decides, releases, does its I/O, and re-takes the lock to commit. The
//! slot's `Starting` and `Ending` phases keep it occupied during those
//! gaps. Session snapshot writes are ordered by a second lock, which a
//! resumed session takes before releasing this one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use slotkeeper_invite::{InviteHolder, InviteValidator};
use slotkeeper_limit::RateLimiter;
use slotkeeper_protocol::{ClientId, EndReason, InviteReason, ServerMessage, SessionId};
use slotkeeper_session::{ReconnectLock, SharedState, Slot};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    Backend, OrchestratorConfig, ProcessExit, ProcessSupervisor, SecretVault, SessionBackend,
};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Handle type of a backend's supervisor.
pub(crate) type HandleOf<B> = <<B as SessionBackend>::Supervisor as ProcessSupervisor>::Handle;
/// Lease type of a backend's vault.
pub(crate) type LeaseOf<B> = <<B as SessionBackend>::Vault as SecretVault>::Lease;

/// Resources held for the running session, next to its bookkeeping.
pub(crate) struct Running<B: SessionBackend> {
    pub(crate) session_id: SessionId,
    pub(crate) handle: Arc<HandleOf<B>>,
    pub(crate) lease: Option<LeaseOf<B>>,
    /// Cancels the warning, timeout, hard-timeout, and exit-watch tasks.
    pub(crate) timers: CancellationToken,
    /// Cancels the reconnect grace timer, while one is running.
    pub(crate) grace: Option<CancellationToken>,
}

/// Everything behind the orchestrator's lock.
pub(crate) struct Core<B: SessionBackend> {
    pub(crate) shared: SharedState,
    pub(crate) running: Option<Running<B>>,
}

/// Things that happen to a session on their own schedule.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SessionEvent {
    Warning(SessionId),
    Timeout(SessionId),
    HardTimeout(SessionId),
    Exited(SessionId, ProcessExit),
    GraceExpired(SessionId),
}

#[derive(Default)]
pub(crate) struct Tally {
    pub(crate) started: AtomicU64,
    pub(crate) ended: AtomicU64,
}

pub(crate) struct Inner<B: SessionBackend> {
    pub(crate) config: OrchestratorConfig,
    pub(crate) core: Mutex<Core<B>>,
    pub(crate) invites: InviteValidator<B::Store>,
    pub(crate) supervisor: B::Supervisor,
    pub(crate) vault: B::Vault,
    pub(crate) reclaimer: B::Reclaimer,
    pub(crate) connection_limiter: RateLimiter,
    pub(crate) invite_limiter: RateLimiter,
    pub(crate) reconnect_lock: ReconnectLock,
    /// Orders session snapshot writes.
    pub(crate) snapshots: Mutex<()>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) tally: Tally,
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// The outcome of [`Orchestrator::join`]. The client has already been sent
/// the matching message; this is for callers and tests that want to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Resumed the session this client's address and invite already own.
    Reconnected,
    /// Another connection is resuming the same session right now.
    ReconnectionInProgress,
    InviteInvalid(InviteReason),
    RateLimited { retry_after_secs: u64 },
    QueueFull,
    AlreadyQueued,
    /// Waiting at this 1-based position.
    Queued { position: usize },
    /// Promoted straight into the slot.
    Started,
    /// Promoted, but the session process could not be started.
    StartFailed,
    /// The client is not registered (it already disconnected).
    UnknownClient,
}

/// The outcome of an invite check outside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteCheck {
    Valid { rejoin: bool },
    Invalid(InviteReason),
    RateLimited { retry_after_secs: u64 },
}

/// What an active session credential unlocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub expires_at: DateTime<Utc>,
    pub platforms: Vec<String>,
}

/// A point-in-time summary of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub clients: usize,
    pub queue_len: usize,
    pub phase: &'static str,
    pub active_session: Option<SessionId>,
    pub active_owner: Option<ClientId>,
    pub awaiting_reconnect: bool,
    pub sessions_started: u64,
    pub sessions_ended: u64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Arbitrates the single session slot among connected clients.
pub struct Orchestrator<B: SessionBackend> {
    pub(crate) inner: Arc<Inner<B>>,
}

impl<B: SessionBackend> Clone for Orchestrator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SessionBackend> Orchestrator<B> {
    /// Builds an orchestrator and starts its event driver.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn new(config: OrchestratorConfig, backend: Backend<B>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                shared: SharedState::new(config.max_queue),
                running: None,
            }),
            invites: InviteValidator::new(backend.store),
            supervisor: backend.supervisor,
            vault: backend.vault,
            reclaimer: backend.reclaimer,
            connection_limiter: RateLimiter::new("connections", config.connection_limit.clone()),
            invite_limiter: RateLimiter::new("invite_failures", config.invite_limit.clone()),
            reconnect_lock: ReconnectLock::new(),
            snapshots: Mutex::new(()),
            events,
            tally: Tally::default(),
            config,
        });
        tokio::spawn(drive(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// The store invite and session records are written to.
    pub fn store(&self) -> &B::Store {
        self.inner.invites.store()
    }

    pub fn invites(&self) -> &InviteValidator<B::Store> {
        &self.inner.invites
    }

    /// Limiter for new connections, consulted by the accept loop.
    pub fn connection_limiter(&self) -> &RateLimiter {
        &self.inner.connection_limiter
    }

    /// Limiter for failed invite validations.
    pub fn invite_limiter(&self) -> &RateLimiter {
        &self.inner.invite_limiter
    }

    /// Clears both limiters' buckets for `ip`. Administrative use only.
    pub fn reset_rate_limits(&self, ip: &str) {
        self.inner.connection_limiter.reset(ip);
        self.inner.invite_limiter.reset(ip);
    }

    /// Sweeps expired buckets from both limiters. Returns how many went.
    pub fn cleanup_rate_limits(&self) -> usize {
        self.inner.connection_limiter.cleanup() + self.inner.invite_limiter.cleanup()
    }

    /// Registers a new connection. Replies go to `outbox`.
    pub async fn register_client(
        &self,
        ip: impl Into<String>,
        user_agent: Option<String>,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> ClientId {
        let mut core = self.inner.core.lock().await;
        core.shared.register(ip, user_agent, outbox)
    }

    /// Checks an invite on behalf of `ip` without joining the queue.
    ///
    /// Applies the invite-failure limiter: blocked addresses are refused
    /// before the store is touched, and each rejection (other than the
    /// store being unavailable) counts against the address.
    pub async fn check_invite(&self, token: &str, ip: &str) -> InviteCheck {
        self.admit_invite(token, ip).await.0
    }

    /// [`check_invite`](Self::check_invite), also returning how many uses
    /// the record had left when it was read.
    pub(crate) async fn admit_invite(&self, token: &str, ip: &str) -> (InviteCheck, u32) {
        let decision = self.inner.invite_limiter.check(ip, false);
        if !decision.allowed {
            let check = InviteCheck::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            };
            return (check, 0);
        }

        let holders = invite_holders(&self.inner.core.lock().await.shared);
        let validation = self.inner.invites.validate(token, ip, &holders).await;
        if validation.valid {
            let left = validation
                .record
                .as_ref()
                .map_or(0, |r| r.max_uses.saturating_sub(r.use_count));
            let check = InviteCheck::Valid {
                rejoin: validation.rejoin,
            };
            return (check, left);
        }

        let reason = validation.reason.unwrap_or(InviteReason::Invalid);
        if reason != InviteReason::Unavailable {
            self.inner.invite_limiter.record_failure(ip);
        }
        (InviteCheck::Invalid(reason), 0)
    }

    /// The active session a credential belongs to, if any.
    pub async fn session_for_credential(&self, token: &str) -> Option<SessionView> {
        let core = self.inner.core.lock().await;
        core.shared.session_for_credential(token).map(|s| SessionView {
            session_id: s.session_id,
            client_id: s.owner,
            expires_at: s.expires_at,
            platforms: s.platforms.clone(),
        })
    }

    /// `true` if the credential was issued and not yet revoked.
    pub async fn credential_known(&self, token: &str) -> bool {
        self.inner.core.lock().await.shared.credential_known(token)
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let core = self.inner.core.lock().await;
        let active = core.shared.slot.active();
        OrchestratorStatus {
            clients: core.shared.client_count(),
            queue_len: core.shared.queue_len(),
            phase: core.shared.slot.phase(),
            active_session: core.shared.slot.session_id(),
            active_owner: active.map(|s| s.owner),
            awaiting_reconnect: active.is_some_and(|s| s.awaiting_reconnect),
            sessions_started: self.inner.tally.started.load(Ordering::Relaxed),
            sessions_ended: self.inner.tally.ended.load(Ordering::Relaxed),
        }
    }

    /// Ends whatever session is active. Used at shutdown.
    pub async fn shutdown(&self) {
        let active = self.inner.core.lock().await.shared.slot.active().map(|s| s.session_id);
        if let Some(session_id) = active {
            tracing::info!(%session_id, "ending active session for shutdown");
            self.end_session(session_id, EndReason::Manual).await;
        }
    }

    pub(crate) async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Warning(id) => self.warn_owner(id).await,
            SessionEvent::Timeout(id) => {
                self.end_session(id, EndReason::Timeout).await;
            }
            SessionEvent::HardTimeout(id) => {
                tracing::warn!(session_id = %id, "hard timeout fired");
                self.end_session(id, EndReason::Timeout).await;
            }
            SessionEvent::Exited(id, exit) => {
                if !exit.success() {
                    self.note_error(id, format!("session process exited with {:?}", exit.code))
                        .await;
                }
                self.end_session(id, EndReason::ContainerExit).await;
            }
            SessionEvent::GraceExpired(id) => self.expire_grace(id).await,
        }
    }
}

/// Drains session events for as long as the orchestrator exists.
async fn drive<B: SessionBackend>(
    inner: Weak<Inner<B>>,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Orchestrator { inner }.handle_event(event).await;
    }
    tracing::debug!("session event driver stopped");
}

/// Every session holding an invite right now: each queued client's pending
/// one, the one being started, the one in the slot, and one still being
/// torn down. Only the last cannot be rejoined.
pub(crate) fn invite_holders(shared: &SharedState) -> Vec<InviteHolder> {
    let mut out = Vec::new();
    let mut push = |ip: &str, token: Option<&String>, rejoinable: bool| {
        if let Some(token) = token {
            out.push(InviteHolder {
                ip: ip.to_string(),
                invite_token: token.clone(),
                rejoinable,
            });
        }
    };

    match &shared.slot {
        Slot::Active(session) => push(&session.ip, session.invite_token.as_ref(), true),
        Slot::Starting { client, .. } => {
            if let Some(c) = shared.client(*client) {
                push(&c.ip, c.invite_token.as_ref(), true);
            }
        }
        Slot::Ending {
            ip, invite_token, ..
        } => push(ip, invite_token.as_ref(), false),
        Slot::Idle => {}
    }
    for (id, _) in shared.live_positions() {
        if let Some(c) = shared.client(id) {
            if c.credential.as_deref().and_then(|t| shared.pending_owner(t)) == Some(id) {
                push(&c.ip, c.invite_token.as_ref(), true);
            }
        }
    }
    out
}
