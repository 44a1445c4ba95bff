//! Queue admission and session lifecycle for slotkeeper.
//!
//! One process owns one session slot. Connected clients wait in a FIFO
//! queue; the head is promoted into the slot, a sandboxed process is
//! started for it, and the session is torn down on timeout, process exit,
//! or the owner leaving.
//!
//! # Key types
//!
//! - [`Orchestrator`]: the handle the connection layer calls into
//! - [`SessionBackend`]: bundles the store, process supervisor, secret
//!   vault, and platform reclaimer a deployment runs with
//! - [`OrchestratorConfig`]: queue size, timers, platforms, limits
//! - [`DockerSupervisor`] / [`EnvFileVault`] / [`LoggingReclaimer`]: the
//!   production collaborators

#![allow(async_fn_in_trait)]

mod backend;
mod config;
mod docker;
mod error;
mod lifecycle;
mod orchestrator;
mod platform;
mod queue;
mod reclaim;
mod reconnect;
mod vault;

pub use backend::{
    Backend, PlatformReclaimer, ProcessExit, ProcessHandle, ProcessSupervisor, SecretLease,
    SecretVault, SessionBackend, SpawnSpec, Spawned,
};
pub use config::OrchestratorConfig;
pub use docker::{ContainerConfig, DockerHandle, DockerSupervisor};
pub use error::OrchestratorError;
pub use lifecycle::{SessionSnapshot, SnapshotStatus};
pub use orchestrator::{InviteCheck, JoinOutcome, Orchestrator, OrchestratorStatus, SessionView};
pub use platform::{Platform, collect_secrets, parse_platforms, platform_label};
pub use reclaim::LoggingReclaimer;
pub use vault::{EnvFileLease, EnvFileVault};
