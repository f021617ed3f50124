//! # remoting-server
//!
//! Provider side of remoting.
//!
//! This crate provides:
//! - TCP connection handling with async I/O and heartbeat answers
//! - Service descriptors with signature-based method dispatch
//! - The server filter chain and the in-flight request bound
//! - Registry publication of exported services
//! - YAML and environment configuration
//! - Prometheus metrics

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, RegistrySettings};
pub use dispatcher::{Dispatcher, ServerInvokeFilterChain, ServerTerminal, SERVER_BUSY};
pub use error::ServerError;
pub use metrics::{run_metrics_server, serve_metrics, Metrics};
pub use provider::ServiceProvider;
pub use server::{Server, ServerConfig, ServerStats};
