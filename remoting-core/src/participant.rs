//! Service participant records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantType {
    Provider,
    Consumer,
}

impl fmt::Display for ParticipantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantType::Provider => f.write_str("PROVIDER"),
            ParticipantType::Consumer => f.write_str("CONSUMER"),
        }
    }
}

/// One provider or consumer process of a service.
///
/// Equality and hashing cover `service_name`, `host`, `port` and type only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParticipantInfo {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceParticipantInfo {
    pub fn new(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        participant_type: ParticipantType,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            participant_type,
            metadata: BTreeMap::new(),
        }
    }

    pub fn provider(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(service_name, host, port, ParticipantType::Provider)
    }

    pub fn consumer(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(service_name, host, port, ParticipantType::Consumer)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_provider(&self) -> bool {
        self.participant_type == ParticipantType::Provider
    }

    pub fn is_consumer(&self) -> bool {
        self.participant_type == ParticipantType::Consumer
    }

    /// `host:port`, the key used by the connection pool.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serializes the record into its self-describing text document.
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The document of the identity fields alone, metadata left out. Equal
    /// participants share it.
    pub fn identity_document(&self) -> Result<String, serde_json::Error> {
        let identity = Self {
            metadata: BTreeMap::new(),
            ..self.clone()
        };
        identity.to_document()
    }

    /// Parses a text document produced by [`to_document`](Self::to_document).
    pub fn from_document(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }
}

impl PartialEq for ServiceParticipantInfo {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.host == other.host
            && self.port == other.port
            && self.participant_type == other.participant_type
    }
}

impl Eq for ServiceParticipantInfo {}

impl Hash for ServiceParticipantInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.participant_type.hash(state);
    }
}
