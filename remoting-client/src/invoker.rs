//! Client invocation path: filter chain, provider resolution and stubs.

use crate::channel::MessageChannel;
use crate::connection::ChannelConfig;
use async_trait::async_trait;
use remoting_core::{
    next_message_id, FilterChain, Invoke, InvokeFilter, InvokeTerminal, RemotingError,
    ServiceParticipantInfo, ServiceRegistry, ValueType,
};
use remoting_protocol::Codec;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Terminal of the client chain: writes the request and waits for the response.
pub struct ClientTerminal {
    channel: MessageChannel,
}

impl ClientTerminal {
    pub fn new(channel: MessageChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl InvokeTerminal for ClientTerminal {
    async fn invoke(&self, invoke: Invoke) -> Result<Value, RemotingError> {
        let id = invoke.id;
        let Some(future) = self.channel.send(invoke.into()).await? else {
            return Ok(Value::Null);
        };

        let fallback_address = future.address().to_string();
        let result = future.wait().await?;
        let address = result.remote_address.clone().unwrap_or(fallback_address);
        match result.into_outcome() {
            Ok(value) => Ok(value.unwrap_or(Value::Null)),
            Err(message) => Err(RemotingError::ServerError {
                id,
                address,
                message,
            }),
        }
    }
}

/// Builder for [`RpcClient`].
#[derive(Default)]
pub struct RpcClientBuilder {
    config: ChannelConfig,
    codec: Option<Codec>,
    filters: Vec<Arc<dyn InvokeFilter>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

impl RpcClientBuilder {
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Appends a filter; filters run in the order they were added.
    pub fn with_filter(mut self, filter: Arc<dyn InvokeFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> RpcClient {
        let channel = MessageChannel::with_codec(self.config, self.codec.unwrap_or_default());
        let chain = FilterChain::new(
            self.filters,
            Arc::new(ClientTerminal::new(channel.clone())),
        );
        RpcClient {
            chain,
            channel,
            registry: self.registry,
            next_provider: AtomicUsize::new(0),
        }
    }
}

/// Entry point for outgoing calls.
pub struct RpcClient {
    chain: FilterChain,
    channel: MessageChannel,
    registry: Option<Arc<dyn ServiceRegistry>>,
    next_provider: AtomicUsize,
}

impl RpcClient {
    pub fn new(config: ChannelConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn builder() -> RpcClientBuilder {
        RpcClientBuilder::default()
    }

    /// Runs `invoke` through the client chain.
    ///
    /// A fresh message id is assigned. Without an explicit remote address the
    /// call goes to one of the registered providers of its service.
    pub async fn invoke(&self, mut invoke: Invoke) -> Result<Value, RemotingError> {
        if self.channel.is_closed() {
            return Err(RemotingError::Closed);
        }
        invoke.id = next_message_id();
        if invoke.remote_address.is_none() {
            let address = self.resolve_address(invoke.service_name()).await?;
            invoke.remote_address = Some(address);
        }
        if let Some(registry) = &self.registry {
            invoke.set_registry(registry.clone());
        }
        self.chain.invoke(invoke).await
    }

    /// Picks a provider of `service_name`, rotating over the current snapshot.
    pub async fn resolve_address(&self, service_name: &str) -> Result<String, RemotingError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            RemotingError::registry(format!(
                "no remote address and no registry to resolve {}",
                service_name
            ))
        })?;
        let providers = registry.get_providers(service_name).await?;
        if providers.is_empty() {
            return Err(RemotingError::registry(format!(
                "no provider for {}",
                service_name
            )));
        }
        let pick = self.next_provider.fetch_add(1, Ordering::Relaxed) % providers.len();
        Ok(providers[pick].address())
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn config(&self) -> &ChannelConfig {
        self.channel.config()
    }

    pub fn registry(&self) -> Option<&Arc<dyn ServiceRegistry>> {
        self.registry.as_ref()
    }

    /// Closes the channel. The registry belongs to whoever built it.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

/// Stub for one `(interface, version)` pair.
pub struct ServiceConsumer {
    client: Arc<RpcClient>,
    interface_name: String,
    version: String,
    service_name: String,
    address: Option<String>,
    timeout: Duration,
    serializer_id: u8,
}

impl ServiceConsumer {
    /// Creates the stub and, when the client has a registry, registers this
    /// process as a consumer so provider lookups have a subscription.
    pub async fn new(
        client: Arc<RpcClient>,
        interface_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, RemotingError> {
        let interface_name = interface_name.into();
        let version = version.into();
        let service_name = remoting_core::service_name(&interface_name, &version);
        let config = client.config();
        let (timeout, serializer_id) = (config.default_timeout, config.serializer_id);

        if let Some(registry) = client.registry() {
            let consumer =
                ServiceParticipantInfo::consumer(service_name.clone(), config.local_host.clone(), 0);
            registry.register_participant(consumer).await?;
            tracing::info!("Registered consumer of {}", service_name);
        }

        Ok(Self {
            client,
            interface_name,
            version,
            service_name,
            address: None,
            timeout,
            serializer_id,
        })
    }

    /// Sends every call to `address` instead of a registered provider.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_serializer(mut self, serializer_id: u8) -> Self {
        self.serializer_id = serializer_id;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn build(&self, method: &str, args: Vec<Value>, types: Vec<ValueType>) -> Invoke {
        let invoke = Invoke::new(
            self.interface_name.clone(),
            self.version.clone(),
            method,
            args,
            types,
        )
        .with_timeout(self.timeout)
        .with_serializer(self.serializer_id);
        match &self.address {
            Some(address) => invoke.with_remote_address(address.clone()),
            None => invoke,
        }
    }

    /// Calls `method`; parameter types are inferred from the arguments.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RemotingError> {
        let types = args.iter().map(ValueType::of).collect();
        self.call_with_types(method, args, types).await
    }

    pub async fn call_with_types(
        &self,
        method: &str,
        args: Vec<Value>,
        types: Vec<ValueType>,
    ) -> Result<Value, RemotingError> {
        self.client.invoke(self.build(method, args, types)).await
    }

    /// Calls `method` and deserializes the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RemotingError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| RemotingError::Serialization {
            id: None,
            message: format!("{}#{} result: {}", self.service_name, method, e),
        })
    }

    /// Fire-and-forget call.
    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RemotingError> {
        let types = args.iter().map(ValueType::of).collect();
        let invoke = self.build(method, args, types).one_way();
        self.client.invoke(invoke).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_invoke, FakeServer, Reply};
    use remoting_core::{ErrorKind, Next};
    use remoting_registry::{DefaultServiceRegistry, MemoryEnsemble, RegistryConfig};
    use serde_json::json;

    fn registry_config() -> RegistryConfig {
        RegistryConfig {
            close_on_shutdown_signal: false,
            ..Default::default()
        }
    }

    fn registry(ensemble: &MemoryEnsemble) -> Arc<DefaultServiceRegistry> {
        let store = Arc::new(ensemble.connect("remoting"));
        Arc::new(DefaultServiceRegistry::new(store, registry_config()))
    }

    fn provider_of(server: &FakeServer) -> ServiceParticipantInfo {
        let address = server.address();
        let (host, port) = address.rsplit_once(':').unwrap();
        ServiceParticipantInfo::provider("Calc:1.0", host, port.parse().unwrap())
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl InvokeFilter for Counting {
        async fn invoke(&self, invoke: Invoke, next: Next<'_>) -> Result<Value, RemotingError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(invoke).await
        }
    }

    #[tokio::test]
    async fn test_invoke_with_explicit_address() {
        let server = FakeServer::start(Reply::Sum).await;
        let client = RpcClient::new(ChannelConfig::default());

        let value = client.invoke(add_invoke(&server.address(), 2, 3)).await.unwrap();
        assert_eq!(value, json!(5));
        client.close().await;
    }

    #[tokio::test]
    async fn test_error_result_maps_to_server_error() {
        let server = FakeServer::start(Reply::Sum).await;
        let client = RpcClient::new(ChannelConfig::default());

        let invoke = Invoke::new("Calc", "1.0", "fail", vec![], vec![])
            .with_remote_address(server.address());
        let err = client.invoke(invoke).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
        match err {
            RemotingError::ServerError { id, address, message } => {
                assert!(id > 0);
                assert_eq!(address, server.address());
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_one_way_invoke_returns_null() {
        let server = FakeServer::start(Reply::Sum).await;
        let client = RpcClient::new(ChannelConfig::default());

        let value = client
            .invoke(add_invoke(&server.address(), 1, 1).one_way())
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_filters_wrap_terminal() {
        let server = FakeServer::start(Reply::Sum).await;
        let count = Arc::new(AtomicUsize::new(0));
        let client = RpcClient::builder()
            .with_filter(Arc::new(Counting(count.clone())))
            .with_filter(Arc::new(remoting_core::TracingFilter))
            .build();

        client.invoke(add_invoke(&server.address(), 1, 2)).await.unwrap();
        client.invoke(add_invoke(&server.address(), 3, 4)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_address_without_registry() {
        let client = RpcClient::new(ChannelConfig::default());
        let invoke = Invoke::new("Calc", "1.0", "add", vec![], vec![]);
        let err = client.invoke(invoke).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Registry);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let server = FakeServer::start(Reply::Sum).await;
        let client = RpcClient::new(ChannelConfig::default());
        client.close().await;

        let err = client.invoke(add_invoke(&server.address(), 1, 2)).await.unwrap_err();
        assert!(matches!(err, RemotingError::Closed));
        assert_eq!(server.connections_accepted(), 0);
    }

    #[tokio::test]
    async fn test_consumer_resolves_provider_from_registry() {
        let server = FakeServer::start(Reply::Sum).await;
        let ensemble = MemoryEnsemble::new();

        let provider_side = registry(&ensemble);
        provider_side.register_participant(provider_of(&server)).await.unwrap();

        let consumer_side = registry(&ensemble);
        let client = Arc::new(
            RpcClient::builder()
                .with_registry(consumer_side.clone())
                .build(),
        );
        let calc = ServiceConsumer::new(client.clone(), "Calc", "1.0").await.unwrap();
        assert_eq!(calc.service_name(), "Calc:1.0");

        let sum: i64 = calc.call_as("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(sum, 5);
        assert_eq!(consumer_side.local_participants().len(), 1);

        provider_side.close().await;
        consumer_side.close().await;
    }

    #[tokio::test]
    async fn test_consumer_without_providers() {
        let ensemble = MemoryEnsemble::new();
        let consumer_side = registry(&ensemble);
        let client = Arc::new(
            RpcClient::builder()
                .with_registry(consumer_side.clone())
                .build(),
        );
        let calc = ServiceConsumer::new(client, "Calc", "1.0").await.unwrap();

        let err = calc.call("add", vec![json!(1), json!(2)]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Registry);
        consumer_side.close().await;
    }

    #[tokio::test]
    async fn test_consumer_with_address_and_timeout() {
        let server = FakeServer::start(Reply::Never).await;
        let client = Arc::new(RpcClient::new(ChannelConfig::default()));
        let calc = ServiceConsumer::new(client, "Calc", "1.0")
            .await
            .unwrap()
            .with_address(server.address())
            .with_timeout(Duration::from_millis(50));

        let err = calc.call("add", vec![json!(1), json!(2)]).await.unwrap_err();
        assert!(matches!(err, RemotingError::Timeout { timeout_ms: 50, .. }));
        assert!(err.is_retryable());

        calc.notify("add", vec![json!(1)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_as_type_mismatch() {
        let server = FakeServer::start(Reply::Sum).await;
        let client = Arc::new(RpcClient::new(ChannelConfig::default()));
        let calc = ServiceConsumer::new(client, "Calc", "1.0")
            .await
            .unwrap()
            .with_address(server.address());

        let err = calc
            .call_as::<String>("add", vec![json!(1), json!(2)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
