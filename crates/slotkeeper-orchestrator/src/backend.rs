//! Collaborator traits: what the orchestrator needs from the outside world.
//!
//! The orchestrator never shells out, writes files, or calls third-party
//! APIs itself. It asks three narrow collaborators:
//!
//! - a [`SecretVault`] to put a session's secrets somewhere the sandboxed
//!   process can read them, and take them away again
//! - a [`ProcessSupervisor`] to start the sandboxed process, stop it, and
//!   report when it exits
//! - a [`PlatformReclaimer`] to tidy up third-party platforms after a session
//!
//! [`SessionBackend`] ties one choice of each (plus the [`Store`]) together,
//! so `Orchestrator<B>` carries a single type parameter.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Production;
//!
//! impl SessionBackend for Production {
//!     type Store = RedisStore;
//!     type Supervisor = DockerSupervisor;
//!     type Vault = EnvFileVault;
//!     type Reclaimer = LoggingReclaimer;
//! }
//! ```

use std::future::Future;

use slotkeeper_protocol::{EndReason, SessionId};
use slotkeeper_store::Store;
use tokio::sync::oneshot;

use crate::OrchestratorError;

// ---------------------------------------------------------------------------
// Backend bundle
// ---------------------------------------------------------------------------

/// The set of collaborator types an orchestrator runs with.
///
/// This is a marker trait with only associated types; implement it on a
/// unit struct.
pub trait SessionBackend: Send + Sync + 'static {
    type Store: Store;
    type Supervisor: ProcessSupervisor;
    type Vault: SecretVault;
    type Reclaimer: PlatformReclaimer;
}

/// Collaborator instances handed to [`Orchestrator::new`](crate::Orchestrator::new).
pub struct Backend<B: SessionBackend> {
    pub store: B::Store,
    pub supervisor: B::Supervisor,
    pub vault: B::Vault,
    pub reclaimer: B::Reclaimer,
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Materializes secrets for one session.
pub trait SecretVault: Send + Sync + 'static {
    type Lease: SecretLease;

    /// Stores `secrets` (name, value) for `session` and returns a lease
    /// whose [`reference`](SecretLease::reference) the process can use.
    fn materialize(
        &self,
        session: SessionId,
        secrets: &[(String, String)],
    ) -> impl Future<Output = Result<Self::Lease, OrchestratorError>> + Send;
}

/// A handle to materialized secrets. Releasing it destroys them.
pub trait SecretLease: Send + Sync + 'static {
    /// What the process is given to find the secrets (a path, for files).
    fn reference(&self) -> &str;

    /// Destroys the secrets. Must not fail loudly: log and move on.
    fn release(self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Everything needed to start one sandboxed session process.
///
/// Secrets are only passed by reference (`secrets_ref`), never as values,
/// so they can't show up in a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub session_id: SessionId,
    /// A name unique to this session, usable to address the process later.
    pub name: String,
    pub secrets_ref: String,
    /// Non-secret environment for the process.
    pub env: Vec<(String, String)>,
}

/// How a session process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A started process and the channel its exit will be reported on.
pub struct Spawned<H> {
    pub handle: H,
    pub exited: oneshot::Receiver<ProcessExit>,
}

/// Starts session processes.
pub trait ProcessSupervisor: Send + Sync + 'static {
    type Handle: ProcessHandle;

    fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> impl Future<Output = Result<Spawned<Self::Handle>, OrchestratorError>> + Send;
}

/// Controls one running session process.
pub trait ProcessHandle: Send + Sync + 'static {
    /// Asks the process to stop gracefully.
    fn terminate(&self) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    /// Stops the process now.
    fn kill(&self) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

// ---------------------------------------------------------------------------
// Reclamation
// ---------------------------------------------------------------------------

/// Post-session cleanup on third-party platforms.
///
/// Fire-and-forget: implementations that do real work should spawn it and
/// return immediately. Teardown does not wait.
pub trait PlatformReclaimer: Send + Sync + 'static {
    fn reclaim(&self, platform: &str, session: SessionId, reason: EndReason);
}
