//! Error types for the store layer.

/// Errors that can occur talking to the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A stored value wasn't the JSON we expected (or ours didn't serialize).
    #[error("store value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The Redis backend returned an error or is unreachable.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend is unavailable for some other reason.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
