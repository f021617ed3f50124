//! Hierarchical coordination store abstraction.
//!
//! Operations are issued from the caller; their asynchronous outcomes
//! (children listings, watch notifications, connection state changes) arrive
//! on a single event stream consumed by one task.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Session connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Lost,
    Reconnected,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchedEventType {
    NodeCreated,
    NodeDeleted,
    NodeChildrenChanged,
}

/// Asynchronous notifications from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// Result of [`CoordinationStore::request_children`].
    Children { path: String, children: Vec<String> },
    /// A one-shot watch fired.
    Watched {
        path: String,
        event_type: WatchedEventType,
    },
    StateChanged(ConnectionState),
    /// A failure with no caller to report to.
    Error { message: String },
}

/// A session against a hierarchical store with ephemeral nodes and one-shot
/// children watches. Paths are relative to the store's namespace.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Opens the session. Starting a started store is a no-op.
    async fn start(&self) -> Result<(), StoreError>;

    /// Creates a node holding `data`. The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Requests the children of `path` and leaves a one-shot children watch
    /// on it. The listing arrives as [`StoreEvent::Children`].
    async fn request_children(&self, path: &str) -> Result<(), StoreError>;

    /// Takes the event stream. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>>;

    /// Ends the session; its ephemeral nodes are removed.
    async fn close(&self);
}
