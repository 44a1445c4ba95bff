//! Mock collaborators shared by the server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slotkeeper::Config;
use slotkeeper_invite::InviteRecord;
use slotkeeper_orchestrator::{
    Backend, Orchestrator, OrchestratorError, PlatformReclaimer, ProcessExit, ProcessHandle,
    ProcessSupervisor, SecretLease, SecretVault, SessionBackend, SpawnSpec, Spawned,
};
use slotkeeper_protocol::{EndReason, SessionId};
use slotkeeper_store::{MemoryStore, invite_key, set_json};
use tokio::sync::oneshot;

/// Keeps every spawned process "running" until the test exits it.
#[derive(Clone, Default)]
pub struct ParkedSupervisor {
    exits: Arc<Mutex<HashMap<String, oneshot::Sender<ProcessExit>>>>,
}

impl ParkedSupervisor {
    pub fn running(&self) -> usize {
        self.exits.lock().len()
    }

    pub fn exit_all(&self, code: Option<i32>) {
        for (_, tx) in self.exits.lock().drain() {
            let _ = tx.send(ProcessExit { code });
        }
    }
}

pub struct ParkedHandle;

impl ProcessSupervisor for ParkedSupervisor {
    type Handle = ParkedHandle;

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Spawned<ParkedHandle>, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.exits.lock().insert(spec.name.clone(), tx);
        Ok(Spawned {
            handle: ParkedHandle,
            exited: rx,
        })
    }
}

impl ProcessHandle for ParkedHandle {
    async fn terminate(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn kill(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

pub struct NullVault;

pub struct NullLease(String);

impl SecretVault for NullVault {
    type Lease = NullLease;

    async fn materialize(
        &self,
        session: SessionId,
        _secrets: &[(String, String)],
    ) -> Result<NullLease, OrchestratorError> {
        Ok(NullLease(format!("/dev/null/{}", session.short())))
    }
}

impl SecretLease for NullLease {
    fn reference(&self) -> &str {
        &self.0
    }

    async fn release(self) {}
}

pub struct NullReclaimer;

impl PlatformReclaimer for NullReclaimer {
    fn reclaim(&self, _platform: &str, _session: SessionId, _reason: EndReason) {}
}

pub struct TestBackend;

impl SessionBackend for TestBackend {
    type Store = Arc<MemoryStore>;
    type Supervisor = ParkedSupervisor;
    type Vault = NullVault;
    type Reclaimer = NullReclaimer;
}

pub struct Mocks {
    pub store: Arc<MemoryStore>,
    pub supervisor: ParkedSupervisor,
}

pub fn backend() -> (Backend<TestBackend>, Mocks) {
    let store = Arc::new(MemoryStore::new());
    let supervisor = ParkedSupervisor::default();
    let backend = Backend {
        store: Arc::clone(&store),
        supervisor: supervisor.clone(),
        vault: NullVault,
        reclaimer: NullReclaimer,
    };
    (backend, Mocks { store, supervisor })
}

/// A config bound to ephemeral local ports.
pub fn local_config() -> Config {
    let mut config = Config::default();
    config.server.ws_bind = "127.0.0.1:0".into();
    config.server.http_bind = "127.0.0.1:0".into();
    config.session.enabled_platforms = vec!["jira".into()];
    config
}

/// An orchestrator on the test backend, for driving the HTTP router directly.
pub fn orchestrator(config: &Config) -> (Orchestrator<TestBackend>, Mocks) {
    let (backend, mocks) = backend();
    let orchestrator_config = config.orchestrator().expect("valid config");
    (Orchestrator::new(orchestrator_config, backend), mocks)
}

pub async fn seed_invite(store: &Arc<MemoryStore>, record: InviteRecord) {
    set_json(store, &invite_key(&record.token), &record, Duration::from_secs(86_400))
        .await
        .expect("seed invite");
}
