//! Coordination store errors.

use remoting_core::RemotingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection loss")]
    ConnectionLoss,

    #[error("store not started")]
    NotStarted,

    #[error("store closed")]
    Closed,

    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("store i/o error: {0}")]
    Io(String),

    #[error("malformed store frame: {0}")]
    Protocol(String),
}

impl From<StoreError> for RemotingError {
    fn from(err: StoreError) -> Self {
        RemotingError::Registry(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoting_core::ErrorKind;

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::NoNode("/a/b".into()).to_string(),
            "no node: /a/b"
        );
        assert_eq!(StoreError::ConnectTimeout(5000).to_string(), "connect timed out after 5000ms");
    }

    #[test]
    fn test_into_registry_error() {
        let err: RemotingError = StoreError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Registry);
        assert!(err.to_string().contains("store closed"));
    }
}
