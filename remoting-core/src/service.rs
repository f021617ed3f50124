//! Seams between the invocation path and its collaborators.

use crate::error::RemotingError;
use crate::message::Invoke;
use crate::participant::ServiceParticipantInfo;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Discovery of providers and publication of local participants.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publishes a participant. Registering a structurally equal participant
    /// twice is a no-op.
    async fn register_participant(
        &self,
        participant: ServiceParticipantInfo,
    ) -> Result<(), RemotingError>;

    /// Returns the current provider snapshot for a service, waiting for the
    /// first snapshot if the subscription has not delivered one yet.
    async fn get_providers(
        &self,
        service_name: &str,
    ) -> Result<Arc<Vec<ServiceParticipantInfo>>, RemotingError>;

    /// Releases the registry session.
    async fn close(&self);
}

/// An object bound to a service name on the provider side.
#[async_trait]
pub trait ServiceTarget: Send + Sync {
    fn service_name(&self) -> &str;

    /// Dispatches a call by method name and parameter types.
    async fn invoke(&self, invoke: &Invoke) -> Result<Value, RemotingError>;
}
