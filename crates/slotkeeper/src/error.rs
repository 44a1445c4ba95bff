//! Unified error type for the slotkeeper server.

use slotkeeper_orchestrator::OrchestratorError;
use slotkeeper_protocol::ProtocolError;
use slotkeeper_store::StoreError;
use slotkeeper_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum SlotkeeperError {
    /// A transport-level error (listener, handshake, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The invite/session store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The configuration file is missing, malformed, or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Binding the HTTP listener or serving on it failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
