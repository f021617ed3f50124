//! Request, response and heartbeat messages.

use crate::service::{ServiceRegistry, ServiceTarget};
use crate::types::ValueType;
use crate::{DEFAULT_SERIALIZER_ID, DEFAULT_TIMEOUT_MS};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(1);

/// Returns the next process-wide message id.
///
/// Ids are unique across every in-flight two-way message of the process.
pub fn next_message_id() -> i64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Any frame that can travel over a connection.
#[derive(Debug, Clone)]
pub enum Message {
    Invoke(Invoke),
    Result(InvokeResult),
    Heartbeat(HeartbeatMessage),
}

impl Message {
    pub fn id(&self) -> i64 {
        match self {
            Message::Invoke(m) => m.id,
            Message::Result(m) => m.id,
            Message::Heartbeat(m) => m.id,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        match self {
            Message::Invoke(m) => m.id = id,
            Message::Result(m) => m.id = id,
            Message::Heartbeat(m) => m.id = id,
        }
    }

    /// Returns whether the peer is expected to answer.
    pub fn is_two_way(&self) -> bool {
        match self {
            Message::Invoke(m) => m.two_way,
            Message::Result(_) => false,
            Message::Heartbeat(m) => m.kind == HeartbeatKind::Ping,
        }
    }

    /// Serializer id of the body; heartbeats have no body and use slot 0.
    pub fn serializer_id(&self) -> u8 {
        match self {
            Message::Invoke(m) => m.serializer_id,
            Message::Result(m) => m.serializer_id,
            Message::Heartbeat(_) => 0,
        }
    }

    pub fn remote_address(&self) -> Option<&str> {
        match self {
            Message::Invoke(m) => m.remote_address.as_deref(),
            Message::Result(m) => m.remote_address.as_deref(),
            Message::Heartbeat(m) => m.remote_address.as_deref(),
        }
    }

    pub fn set_remote_address(&mut self, address: impl Into<String>) {
        let address = Some(address.into());
        match self {
            Message::Invoke(m) => m.remote_address = address,
            Message::Result(m) => m.remote_address = address,
            Message::Heartbeat(m) => m.remote_address = address,
        }
    }

    /// Per-request timeout; only requests carry one.
    pub fn timeout(&self) -> Duration {
        match self {
            Message::Invoke(m) => m.timeout(),
            _ => Duration::ZERO,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Message::Heartbeat(_))
    }
}

impl From<Invoke> for Message {
    fn from(invoke: Invoke) -> Self {
        Message::Invoke(invoke)
    }
}

impl From<InvokeResult> for Message {
    fn from(result: InvokeResult) -> Self {
        Message::Result(result)
    }
}

impl From<HeartbeatMessage> for Message {
    fn from(heartbeat: HeartbeatMessage) -> Self {
        Message::Heartbeat(heartbeat)
    }
}

/// Heartbeat direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    /// Two-way heartbeat.
    Ping,
    /// One-way acknowledgement.
    Pong,
}

/// Keep-alive frame with an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub kind: HeartbeatKind,
    pub id: i64,
    pub remote_address: Option<String>,
}

impl HeartbeatMessage {
    pub const PING: HeartbeatMessage = HeartbeatMessage {
        kind: HeartbeatKind::Ping,
        id: 0,
        remote_address: None,
    };

    pub const PONG: HeartbeatMessage = HeartbeatMessage {
        kind: HeartbeatKind::Pong,
        id: 0,
        remote_address: None,
    };

    pub fn ping(id: i64) -> Self {
        Self {
            id,
            ..Self::PING
        }
    }

    pub fn pong(id: i64) -> Self {
        Self {
            id,
            ..Self::PONG
        }
    }

    pub fn is_ping(&self) -> bool {
        self.kind == HeartbeatKind::Ping
    }
}

/// A remote method call.
#[derive(Clone)]
pub struct Invoke {
    pub id: i64,
    pub two_way: bool,
    pub serializer_id: u8,
    pub remote_address: Option<String>,
    pub timeout_ms: u64,
    interface_name: String,
    version: String,
    method_name: String,
    service_name: String,
    args: Vec<Value>,
    parameter_type_names: Vec<String>,
    parameter_types: Option<Vec<ValueType>>,
    generic: bool,
    target: Option<Arc<dyn ServiceTarget>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

impl Invoke {
    /// Creates a call whose parameter types are known to the caller.
    pub fn new(
        interface_name: impl Into<String>,
        version: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Value>,
        parameter_types: Vec<ValueType>,
    ) -> Self {
        let names = parameter_types.iter().map(|t| t.name().to_string()).collect();
        Self::build(
            interface_name.into(),
            version.into(),
            method_name.into(),
            args,
            names,
            Some(parameter_types),
        )
    }

    /// Creates a call described only by parameter type names.
    pub fn generic(
        interface_name: impl Into<String>,
        version: impl Into<String>,
        method_name: impl Into<String>,
        args: Vec<Value>,
        parameter_type_names: Vec<String>,
    ) -> Self {
        Self::build(
            interface_name.into(),
            version.into(),
            method_name.into(),
            args,
            parameter_type_names,
            None,
        )
    }

    /// Creates a call from decoded parts, resolving each type name.
    ///
    /// The call is generic as soon as one name does not resolve.
    pub fn decoded(
        interface_name: String,
        version: String,
        method_name: String,
        args: Vec<Value>,
        parameter_type_names: Vec<String>,
    ) -> Self {
        let resolved: Option<Vec<ValueType>> = parameter_type_names
            .iter()
            .map(|name| ValueType::resolve(name))
            .collect();
        Self::build(
            interface_name,
            version,
            method_name,
            args,
            parameter_type_names,
            resolved,
        )
    }

    fn build(
        interface_name: String,
        version: String,
        method_name: String,
        args: Vec<Value>,
        parameter_type_names: Vec<String>,
        parameter_types: Option<Vec<ValueType>>,
    ) -> Self {
        let service_name = crate::service_name(&interface_name, &version);
        Self {
            id: 0,
            two_way: true,
            serializer_id: DEFAULT_SERIALIZER_ID,
            remote_address: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            generic: parameter_types.is_none(),
            interface_name,
            version,
            method_name,
            service_name,
            args,
            parameter_type_names,
            parameter_types,
            target: None,
            registry: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn with_serializer(mut self, serializer_id: u8) -> Self {
        self.serializer_id = serializer_id;
        self
    }

    /// Marks the call as fire-and-forget.
    pub fn one_way(mut self) -> Self {
        self.two_way = false;
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// `interface_name:version`.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    pub fn parameter_type_names(&self) -> &[String] {
        &self.parameter_type_names
    }

    /// Resolved parameter types; `None` for generic calls.
    pub fn parameter_types(&self) -> Option<&[ValueType]> {
        self.parameter_types.as_deref()
    }

    pub fn is_generic(&self) -> bool {
        self.generic
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Server-side binding to the dispatched object.
    pub fn target(&self) -> Option<&Arc<dyn ServiceTarget>> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: Arc<dyn ServiceTarget>) {
        self.target = Some(target);
    }

    pub fn registry(&self) -> Option<&Arc<dyn ServiceRegistry>> {
        self.registry.as_ref()
    }

    pub fn set_registry(&mut self, registry: Arc<dyn ServiceRegistry>) {
        self.registry = Some(registry);
    }
}

impl fmt::Debug for Invoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("id", &self.id)
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("parameter_type_names", &self.parameter_type_names)
            .field("args", &self.args)
            .field("two_way", &self.two_way)
            .field("generic", &self.generic)
            .field("serializer_id", &self.serializer_id)
            .field("remote_address", &self.remote_address)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Response to an [`Invoke`]: a value or a server-side error message.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResult {
    pub id: i64,
    pub serializer_id: u8,
    pub remote_address: Option<String>,
    outcome: Result<Option<Value>, String>,
}

impl InvokeResult {
    /// Successful result. `None` and `Value::Null` both travel as the `NULL` token.
    pub fn ok(id: i64, value: Option<Value>) -> Self {
        let value = value.filter(|v| !v.is_null());
        Self {
            id,
            serializer_id: DEFAULT_SERIALIZER_ID,
            remote_address: None,
            outcome: Ok(value),
        }
    }

    /// Error result carrying a message.
    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            serializer_id: DEFAULT_SERIALIZER_ID,
            remote_address: None,
            outcome: Err(message.into()),
        }
    }

    pub fn with_serializer(mut self, serializer_id: u8) -> Self {
        self.serializer_id = serializer_id;
        self
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok().and_then(|v| v.as_ref())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    /// Wire name of the result type, or `None` when the result is absent.
    pub fn result_type_name(&self) -> Option<&'static str> {
        self.value().map(|v| ValueType::of(v).name())
    }

    pub fn into_outcome(self) -> Result<Option<Value>, String> {
        self.outcome
    }
}
