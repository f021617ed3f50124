//! # remoting-core
//!
//! Core types shared by every remoting crate.
//!
//! This crate provides:
//! - Request, response and heartbeat message types
//! - Declared value types used for argument and result checking
//! - Service participant records published to the registry
//! - The invoke filter chain and its terminal seam
//! - The error taxonomy surfaced to callers

pub mod error;
pub mod filter;
pub mod message;
pub mod participant;
pub mod service;
pub mod types;

pub use error::{ErrorKind, RemotingError};
pub use filter::{FilterChain, InvokeFilter, InvokeTerminal, Next, TracingFilter};
pub use message::{
    next_message_id, HeartbeatKind, HeartbeatMessage, Invoke, InvokeResult, Message,
};
pub use participant::{ParticipantType, ServiceParticipantInfo};
pub use service::{ServiceRegistry, ServiceTarget};
pub use types::ValueType;

/// Serializer id used when none is configured (JSON).
pub const DEFAULT_SERIALIZER_ID: u8 = 1;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Builds the canonical service name `interface:version`.
pub fn service_name(interface_name: &str, version: &str) -> String {
    format!("{}:{}", interface_name, version)
}
