//! Server error types.

use crate::config::ConfigError;
use remoting_core::{ErrorKind, RemotingError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] remoting_protocol::ProtocolError),

    #[error(transparent)]
    Remoting(#[from] RemotingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("service {0} is already exported")]
    AlreadyExported(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns the remoting error kind this failure is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Io(_) => ErrorKind::Transport,
            ServerError::Protocol(_) => ErrorKind::Protocol,
            ServerError::Remoting(e) => e.kind(),
            ServerError::Config(_) => ErrorKind::ServerError,
            ServerError::AlreadyExported(_) => ErrorKind::ServerError,
            ServerError::Metrics(_) => ErrorKind::ServerError,
            ServerError::ShuttingDown => ErrorKind::Transport,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
