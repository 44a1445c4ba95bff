//! The collaborators a deployed server runs with.

use std::time::Duration;

use slotkeeper_orchestrator::{
    Backend, DockerSupervisor, EnvFileVault, LoggingReclaimer, SessionBackend,
};
use slotkeeper_store::{MemoryStore, RedisStore, Store, StoreError};

use crate::{Config, SlotkeeperError};

/// Redis when a URL is configured, process memory otherwise.
pub enum AnyStore {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl AnyStore {
    /// Connects to Redis at `url`, or falls back to an in-memory store.
    pub async fn connect(url: Option<&str>) -> Result<Self, StoreError> {
        match url {
            Some(url) => Ok(Self::Redis(RedisStore::connect(url).await?)),
            None => {
                tracing::warn!("no redis_url configured, invites and session records are kept in memory");
                Ok(Self::Memory(MemoryStore::new()))
            }
        }
    }
}

impl Store for AnyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Memory(s) => s.get(key).await,
            Self::Redis(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.set(key, value, ttl).await,
            Self::Redis(s) => s.set(key, value, ttl).await,
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        match self {
            Self::Memory(s) => s.ttl(key).await,
            Self::Redis(s) => s.ttl(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.delete(key).await,
            Self::Redis(s) => s.delete(key).await,
        }
    }
}

/// Docker containers, env-file secrets, and the configured store.
pub struct Production;

impl SessionBackend for Production {
    type Store = AnyStore;
    type Supervisor = DockerSupervisor;
    type Vault = EnvFileVault;
    type Reclaimer = LoggingReclaimer;
}

impl Production {
    /// Connects the store and prepares the secrets directory.
    pub async fn backend(config: &Config) -> Result<Backend<Production>, SlotkeeperError> {
        Ok(Backend {
            store: AnyStore::connect(config.store.redis_url.as_deref()).await?,
            supervisor: DockerSupervisor::new(config.container()),
            vault: EnvFileVault::new()?,
            reclaimer: LoggingReclaimer,
        })
    }
}
