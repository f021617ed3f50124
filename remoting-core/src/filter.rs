//! Invoke filter chain.
//!
//! A chain is an ordered list of [`InvokeFilter`]s followed by exactly one
//! [`InvokeTerminal`]. Each filter receives the call and a [`Next`] handle it
//! may run to continue down the chain; the terminal has no handle and must
//! perform the dispatch itself.

use crate::error::RemotingError;
use crate::message::Invoke;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Interceptor wrapping every call.
#[async_trait]
pub trait InvokeFilter: Send + Sync {
    async fn invoke(&self, invoke: Invoke, next: Next<'_>) -> Result<Value, RemotingError>;
}

/// Last element of a chain; performs the actual dispatch.
#[async_trait]
pub trait InvokeTerminal: Send + Sync {
    async fn invoke(&self, invoke: Invoke) -> Result<Value, RemotingError>;
}

/// Remainder of a chain as seen from one filter.
pub struct Next<'a> {
    rest: &'a [Arc<dyn InvokeFilter>],
    terminal: &'a dyn InvokeTerminal,
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain.
    pub async fn run(self, invoke: Invoke) -> Result<Value, RemotingError> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    rest: tail,
                    terminal: self.terminal,
                };
                head.invoke(invoke, next).await
            }
            None => self.terminal.invoke(invoke).await,
        }
    }
}

/// Linked filters plus their terminal.
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn InvokeFilter>]>,
    terminal: Arc<dyn InvokeTerminal>,
}

impl FilterChain {
    /// Links `filters` in order and appends `terminal`.
    pub fn new(filters: Vec<Arc<dyn InvokeFilter>>, terminal: Arc<dyn InvokeTerminal>) -> Self {
        Self {
            filters: filters.into(),
            terminal,
        }
    }

    /// Runs the call through every filter and the terminal.
    pub async fn invoke(&self, invoke: Invoke) -> Result<Value, RemotingError> {
        let head = Next {
            rest: &self.filters,
            terminal: self.terminal.as_ref(),
        };
        head.run(invoke).await
    }

    /// Number of filters in front of the terminal.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

/// Logs each call with its outcome and latency.
#[derive(Debug, Clone, Default)]
pub struct TracingFilter;

#[async_trait]
impl InvokeFilter for TracingFilter {
    async fn invoke(&self, invoke: Invoke, next: Next<'_>) -> Result<Value, RemotingError> {
        let id = invoke.id;
        let service = invoke.service_name().to_string();
        let method = invoke.method_name().to_string();
        let started = Instant::now();

        let result = next.run(invoke).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => tracing::debug!(id, %service, %method, elapsed_ms, "invoke ok"),
            Err(e) => {
                tracing::warn!(id, %service, %method, elapsed_ms, kind = %e.kind(), "invoke failed: {}", e)
            }
        }
        result
    }
}
