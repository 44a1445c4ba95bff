//! The external store: where invite records and session audits live.
//!
//! The orchestrator's in-memory state is authoritative while the process is
//! alive. The store is a persistence and audit sink that outlives it: invite
//! records (`invite:<token>`) and session snapshots (`session:<clientId>`),
//! each with a TTL.
//!
//! Only four operations are needed, and none of them are transactional.
//! Invite usage counts are read-modify-written without a compare-and-set,
//! which is only sound with a single orchestrator process writing them.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: in-process, TTLs on the tokio clock. Used by tests and
//!   by single-box deployments without Redis.
//! - [`RedisStore`]: behind the `redis` feature (default).

#![allow(async_fn_in_trait)]

mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use std::future::Future;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

/// Key for an invite record.
pub fn invite_key(token: &str) -> String {
    format!("invite:{token}")
}

/// Key for a session snapshot, indexed by the owning client.
pub fn session_key(client_id: impl std::fmt::Display) -> String {
    format!("session:{client_id}")
}

/// A string key/value store with per-key expiry.
///
/// Methods return `Send` futures so they can be awaited from spawned tasks
/// (session timers and teardown run off the connection task).
pub trait Store: Send + Sync + 'static {
    /// Reads a key. Expired and missing keys both yield `Ok(None)`.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Writes a key, replacing any previous value and TTL.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remaining lifetime of a key, or `None` if it is missing or has no expiry.
    fn ttl(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Duration>, StoreError>> + Send;

    /// Removes a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Reads and deserializes a JSON value.
pub async fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: Store,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serializes and writes a JSON value.
pub async fn set_json<S, T>(
    store: &S,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError>
where
    S: Store,
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

impl<S: Store> Store for std::sync::Arc<S> {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send {
        (**self).get(key)
    }

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).set(key, value, ttl)
    }

    fn ttl(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Duration>, StoreError>> + Send {
        (**self).ttl(key)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).delete(key)
    }
}
