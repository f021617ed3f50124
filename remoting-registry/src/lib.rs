//! # remoting-registry
//!
//! Service discovery for remoting.
//!
//! Participants are published as ephemeral nodes of a hierarchical
//! coordination store:
//!
//! ```text
//! /<serviceName>/providers/<participant-identity>
//! /<serviceName>/consumers/<participant-identity>
//! ```
//!
//! Node names carry a participant's identity fields; the node data holds its
//! full document, metadata included.
//!
//! Consumers watch the providers path of their service and keep a cached
//! snapshot of the provider list that is replaced atomically on every refresh.
//!
//! Two stores implement [`CoordinationStore`]: [`MemoryStore`] sessions on an
//! in-process tree, and [`RemoteStore`] sessions on a tree shared over TCP by
//! a [`StoreServer`].

pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod remote;
pub mod store;

pub use config::{RegistryConfig, IN_PROCESS};
pub use error::StoreError;
pub use memory::{MemoryEnsemble, MemoryStore};
pub use registry::DefaultServiceRegistry;
pub use remote::{RemoteStore, StoreServer};
pub use store::{ConnectionState, CoordinationStore, CreateMode, StoreEvent, WatchedEventType};
