//! Error taxonomy for remote invocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors surfaced by the codec, channel, registry and dispatcher.
#[derive(Debug, Clone, Error)]
pub enum RemotingError {
    #[error("protocol error (message {id:?}): {message}")]
    Protocol { id: Option<i64>, message: String },

    #[error("serialization error (message {id:?}): {message}")]
    Serialization { id: Option<i64>, message: String },

    #[error("method not found: {service}#{method}({params})")]
    MethodNotFound {
        service: String,
        method: String,
        params: String,
    },

    #[error("server error from {address} (message {id}): {message}")]
    ServerError {
        id: i64,
        address: String,
        message: String,
    },

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("request {id} to {address} timed out after {timeout_ms}ms")]
    Timeout {
        id: i64,
        address: String,
        timeout_ms: u64,
    },

    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    Closed,

    #[error("registry error: {0}")]
    Registry(String),
}

impl RemotingError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemotingError::Protocol { .. } => ErrorKind::Protocol,
            RemotingError::Serialization { .. } => ErrorKind::Serialization,
            RemotingError::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            RemotingError::ServerError { .. } => ErrorKind::ServerError,
            RemotingError::Invocation(_) => ErrorKind::ServerError,
            RemotingError::Timeout { .. } => ErrorKind::Timeout,
            RemotingError::ConnectFailed { .. } => ErrorKind::Transport,
            RemotingError::Transport(_) => ErrorKind::Transport,
            RemotingError::Closed => ErrorKind::Transport,
            RemotingError::Registry(_) => ErrorKind::Registry,
        }
    }

    /// Returns the message id this error is correlated with, if known.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            RemotingError::Protocol { id, .. } | RemotingError::Serialization { id, .. } => *id,
            RemotingError::ServerError { id, .. } | RemotingError::Timeout { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Returns whether the call may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn registry(message: impl Into<String>) -> Self {
        RemotingError::Registry(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        RemotingError::Transport(message.into())
    }
}

/// Stable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Protocol,
    Serialization,
    MethodNotFound,
    ServerError,
    Timeout,
    Transport,
    Registry,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Transport)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Serialization => "SERIALIZATION",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Registry => "REGISTRY",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
