// ABOUTME: Error types for the session layer
// Separates unknown ids from sandbox failures so callers can tell them apart

use crate::docker::ContainerError;
use crate::models::SessionId;
use crate::protocol::CommandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Session already registered: {0}")]
    DuplicateSession(SessionId),

    #[error("Session has been terminated: {0}")]
    Terminated(SessionId),

    #[error("Failed to provision sandbox: {0}")]
    Provision(#[source] ContainerError),

    #[error("Command failed in sandbox {container}: {source}")]
    Exec {
        container: String,
        #[source]
        source: ContainerError,
    },

    #[error("Output stream error: {0}")]
    Stream(#[source] ContainerError),

    #[error(transparent)]
    InvalidCommand(#[from] CommandError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}
