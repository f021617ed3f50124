//! # remoting-client
//!
//! Client side of remoting.
//!
//! This crate provides:
//! - Pooled TCP connections keyed by `host:port` with idle heartbeats
//! - A message channel correlating two-way requests with their responses
//! - The client filter-chain terminal and a registry-aware invoker
//! - Per-service consumer stubs

pub mod channel;
pub mod connection;
pub mod invoker;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{MessageChannel, MessageFuture};
pub use connection::{ChannelConfig, Connection};
pub use invoker::{ClientTerminal, RpcClient, RpcClientBuilder, ServiceConsumer};
