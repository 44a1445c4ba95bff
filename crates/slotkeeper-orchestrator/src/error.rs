//! Error types for the orchestration layer.

use slotkeeper_protocol::{ClientId, ErrorCode};
use slotkeeper_session::StateError;
use slotkeeper_store::StoreError;

/// Errors that can occur while admitting clients or running a session.
///
/// Routine outcomes (queue full, invite rejected) are not errors; they are
/// replies to the client. These are the cases that get logged.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A shared-state operation was refused.
    #[error(transparent)]
    State(#[from] StateError),

    /// The external store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Secrets could not be materialized.
    #[error("secret materialization failed: {0}")]
    Secrets(String),

    /// The session process could not be started.
    #[error("session process failed to start: {0}")]
    Spawn(String),

    /// Stopping the session process failed.
    #[error("session process control failed: {0}")]
    Control(String),

    /// A platform name in the configuration is not in the catalogue.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// The client being promoted went away while its session was starting.
    #[error("client {0} disconnected during session start")]
    ClientGone(ClientId),

    /// Filesystem or process I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// The wire code reported to a client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::State(StateError::AlreadyQueued(_)) => ErrorCode::AlreadyQueued,
            Self::State(StateError::QueueFull { .. }) => ErrorCode::QueueFull,
            Self::State(StateError::UnknownClient(_)) => ErrorCode::Unauthorized,
            Self::Secrets(_) | Self::Spawn(_) | Self::ClientGone(_) => {
                ErrorCode::SessionStartFailed
            }
            _ => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_maps_queue_errors_to_queue_codes() {
        let full = OrchestratorError::from(StateError::QueueFull { max: 10 });
        assert_eq!(full.code(), ErrorCode::QueueFull);
        let dup = OrchestratorError::from(StateError::AlreadyQueued(ClientId(1)));
        assert_eq!(dup.code(), ErrorCode::AlreadyQueued);
    }

    #[test]
    fn test_code_maps_spawn_failure_to_start_failed() {
        let err = OrchestratorError::Spawn("no docker".into());
        assert_eq!(err.code(), ErrorCode::SessionStartFailed);
        assert!(err.to_string().contains("no docker"));
    }
}
