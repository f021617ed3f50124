//! Request dispatch: exported services, the server filter chain and the
//! in-flight bound.

use crate::error::ServerError;
use crate::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use remoting_core::{
    FilterChain, Invoke, InvokeFilter, InvokeResult, InvokeTerminal, RemotingError, ServiceTarget,
};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error message answered when the in-flight bound is reached.
pub const SERVER_BUSY: &str = "server busy";

/// Terminal of the server chain: calls the target bound to the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerTerminal;

#[async_trait]
impl InvokeTerminal for ServerTerminal {
    async fn invoke(&self, invoke: Invoke) -> Result<Value, RemotingError> {
        let target = invoke.target().cloned().ok_or_else(|| {
            RemotingError::Invocation(format!("no target bound for {}", invoke.service_name()))
        })?;
        target.invoke(&invoke).await
    }
}

/// User filters followed by [`ServerTerminal`].
#[derive(Clone)]
pub struct ServerInvokeFilterChain {
    chain: FilterChain,
}

impl ServerInvokeFilterChain {
    pub fn new(filters: Vec<Arc<dyn InvokeFilter>>) -> Self {
        Self {
            chain: FilterChain::new(filters, Arc::new(ServerTerminal)),
        }
    }

    pub async fn invoke(&self, invoke: Invoke) -> Result<Value, RemotingError> {
        self.chain.invoke(invoke).await
    }

    pub fn filter_count(&self) -> usize {
        self.chain.filter_count()
    }
}

impl Default for ServerInvokeFilterChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Exported services plus the chain every request runs through.
pub struct Dispatcher {
    services: DashMap<String, Arc<dyn ServiceTarget>>,
    chain: ServerInvokeFilterChain,
    inflight: Arc<Semaphore>,
    max_inflight: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(chain: ServerInvokeFilterChain, max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            services: DashMap::new(),
            chain,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Binds a target under its service name.
    pub fn export(&self, target: Arc<dyn ServiceTarget>) -> Result<(), ServerError> {
        let name = target.service_name().to_string();
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServerError::AlreadyExported(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(target);
                if let Some(ref metrics) = self.metrics {
                    metrics.services_exported.set(self.services.len() as f64);
                }
                Ok(())
            }
        }
    }

    pub fn unexport(&self, service_name: &str) -> bool {
        let removed = self.services.remove(service_name).is_some();
        if let Some(ref metrics) = self.metrics {
            metrics.services_exported.set(self.services.len() as f64);
        }
        removed
    }

    pub fn service(&self, service_name: &str) -> Option<Arc<dyn ServiceTarget>> {
        self.services.get(service_name).map(|entry| entry.value().clone())
    }

    /// Exported service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Reserves an in-flight slot, or `None` when the bound is reached.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inflight.clone().try_acquire_owned().ok()
    }

    /// Requests currently holding a slot.
    pub fn inflight(&self) -> usize {
        self.max_inflight - self.inflight.available_permits()
    }

    /// The answer to a request refused for lack of a slot.
    pub fn busy(&self, invoke: &Invoke) -> InvokeResult {
        if let Some(ref metrics) = self.metrics {
            metrics.busy_rejections_total.inc();
        }
        tracing::warn!(
            "Refusing request id={} for {}: {}",
            invoke.id,
            invoke.service_name(),
            SERVER_BUSY
        );
        InvokeResult::error(invoke.id, SERVER_BUSY).with_serializer(invoke.serializer_id)
    }

    /// Runs one request through the chain and frames the outcome.
    pub async fn dispatch(&self, mut invoke: Invoke) -> InvokeResult {
        let id = invoke.id;
        let serializer_id = invoke.serializer_id;
        let service = invoke.service_name().to_string();
        let started = Instant::now();

        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[service.as_str()]).inc();
            metrics.requests_inflight.inc();
        }

        let outcome = match self.service(&service) {
            Some(target) => {
                invoke.set_target(target);
                match AssertUnwindSafe(self.chain.invoke(invoke)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        tracing::error!("Handler for request id={} of {} panicked: {}", id, service, reason);
                        Err(RemotingError::Invocation(format!(
                            "service {} panicked: {}",
                            service, reason
                        )))
                    }
                }
            }
            None => Err(RemotingError::Invocation(format!(
                "service {} is not exported",
                service
            ))),
        };

        if let Some(ref metrics) = self.metrics {
            metrics.requests_inflight.dec();
            metrics
                .request_duration
                .with_label_values(&[service.as_str()])
                .observe(started.elapsed().as_secs_f64());
            if let Err(ref e) = outcome {
                metrics.errors_total.with_label_values(&[e.kind().as_str()]).inc();
            }
        }

        let result = match outcome {
            Ok(value) => InvokeResult::ok(id, Some(value)),
            Err(e) => {
                tracing::debug!("Request id={} for {} failed: {}", id, service, e);
                InvokeResult::error(id, error_message(&e))
            }
        };
        result.with_serializer(serializer_id)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Text carried in an error response.
fn error_message(err: &RemotingError) -> String {
    match err {
        RemotingError::Invocation(message) => message.clone(),
        other => other.to_string(),
    }
}
