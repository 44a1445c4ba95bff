//! Error types for the shared state.

use slotkeeper_protocol::ClientId;

/// Errors from mutating [`SharedState`](crate::SharedState).
///
/// Most of these are routine outcomes the orchestrator turns into a reply
/// (`queue_full`, `error ALREADY_QUEUED`), not faults.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No client is registered under this id. It has disconnected.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// The client is already waiting in the queue.
    #[error("client {0} is already queued")]
    AlreadyQueued(ClientId),

    /// The queue is at capacity.
    #[error("queue is full ({max} entries)")]
    QueueFull { max: usize },
}
