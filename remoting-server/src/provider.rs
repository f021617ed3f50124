//! Service descriptors.
//!
//! A [`ServiceProvider`] binds a service name to a method table built at
//! registration time. Dispatch first looks for a method whose declared
//! parameter types equal the request's resolved types, then for a method of
//! the same name and arity whose declared types accept every argument. A
//! provider may also carry a generic handler that receives any call the table
//! cannot resolve.

use async_trait::async_trait;
use futures::future::BoxFuture;
use remoting_core::{Invoke, RemotingError, ServiceTarget, ValueType};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

type CallFuture = BoxFuture<'static, Result<Value, RemotingError>>;
type MethodHandler = Arc<dyn Fn(Vec<Value>) -> CallFuture + Send + Sync>;
type GenericHandler = Arc<dyn Fn(String, Vec<Value>) -> CallFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    types: Vec<ValueType>,
}

struct MethodEntry {
    key: MethodKey,
    handler: MethodHandler,
}

impl MethodEntry {
    fn accepts(&self, name: &str, args: &[Value]) -> bool {
        self.key.name == name
            && self.key.types.len() == args.len()
            && self.key.types.iter().zip(args).all(|(ty, arg)| ty.accepts(arg))
    }
}

/// Method table of one exported service.
pub struct ServiceProvider {
    interface_name: String,
    version: String,
    service_name: String,
    methods: Vec<MethodEntry>,
    index: HashMap<MethodKey, usize>,
    generic: Option<GenericHandler>,
    metadata: BTreeMap<String, String>,
}

impl ServiceProvider {
    pub fn new(interface_name: impl Into<String>, version: impl Into<String>) -> Self {
        let interface_name = interface_name.into();
        let version = version.into();
        let service_name = remoting_core::service_name(&interface_name, &version);
        Self {
            interface_name,
            version,
            service_name,
            methods: Vec::new(),
            index: HashMap::new(),
            generic: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds an async method. A later method with the same name and types
    /// replaces the earlier one.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, types: Vec<ValueType>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemotingError>> + Send + 'static,
    {
        let key = MethodKey {
            name: name.into(),
            types,
        };
        let handler: MethodHandler = Arc::new(move |args| -> CallFuture { Box::pin(f(args)) });
        match self.index.get(&key) {
            Some(&slot) => self.methods[slot].handler = handler,
            None => {
                self.index.insert(key.clone(), self.methods.len());
                self.methods.push(MethodEntry { key, handler });
            }
        }
        self
    }

    /// Adds a method whose body does not await.
    pub fn sync_method<F>(self, name: impl Into<String>, types: Vec<ValueType>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RemotingError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.method(name, types, move |args| {
            let f = f.clone();
            async move { f(args) }
        })
    }

    /// Handles every call the method table cannot resolve.
    pub fn generic<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemotingError>> + Send + 'static,
    {
        self.generic = Some(Arc::new(move |method, args| -> CallFuture {
            Box::pin(f(method, args))
        }));
        self
    }

    /// Attaches metadata published with the provider record.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// `name(type, ...)` for every method, in registration order.
    pub fn signatures(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|m| format!("{}({})", m.key.name, join_types(&m.key.types)))
            .collect()
    }

    fn resolve(&self, invoke: &Invoke) -> Option<&MethodEntry> {
        if let Some(types) = invoke.parameter_types() {
            let key = MethodKey {
                name: invoke.method_name().to_string(),
                types: types.to_vec(),
            };
            if let Some(&slot) = self.index.get(&key) {
                return Some(&self.methods[slot]);
            }
        }
        self.methods
            .iter()
            .find(|m| m.accepts(invoke.method_name(), invoke.args()))
    }
}

fn join_types(types: &[ValueType]) -> String {
    types.iter().map(ValueType::name).collect::<Vec<_>>().join(", ")
}

#[async_trait]
impl ServiceTarget for ServiceProvider {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn invoke(&self, invoke: &Invoke) -> Result<Value, RemotingError> {
        if let Some(method) = self.resolve(invoke) {
            return (method.handler)(invoke.args().to_vec()).await;
        }
        if let Some(generic) = &self.generic {
            return generic(invoke.method_name().to_string(), invoke.args().to_vec()).await;
        }
        Err(RemotingError::MethodNotFound {
            service: self.service_name.clone(),
            method: invoke.method_name().to_string(),
            params: invoke.parameter_type_names().join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calc() -> ServiceProvider {
        ServiceProvider::new("Calc", "1.0")
            .sync_method("add", vec![ValueType::Int, ValueType::Int], |args| {
                let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total))
            })
            .sync_method("add", vec![ValueType::Double, ValueType::Double], |args| {
                let total: f64 = args.iter().filter_map(Value::as_f64).sum();
                Ok(json!(total))
            })
            .method("neg", vec![ValueType::Long], |args| async move {
                let n = args[0].as_i64().unwrap_or(0);
                Ok(json!(-n))
            })
    }

    fn invoke(method: &str, args: Vec<Value>, types: Vec<ValueType>) -> Invoke {
        Invoke::new("Calc", "1.0", method, args, types)
    }

    #[tokio::test]
    async fn test_exact_signature_dispatch() {
        let provider = calc();
        assert_eq!(provider.service_name(), "Calc:1.0");
        assert_eq!(provider.method_count(), 3);

        let result = provider
            .invoke(&invoke("add", vec![json!(2), json!(3)], vec![ValueType::Int, ValueType::Int]))
            .await
            .unwrap();
        assert_eq!(result, json!(5));

        let result = provider
            .invoke(&invoke(
                "add",
                vec![json!(1.5), json!(1.0)],
                vec![ValueType::Double, ValueType::Double],
            ))
            .await
            .unwrap();
        assert_eq!(result, json!(2.5));
    }

    #[tokio::test]
    async fn test_accepting_signature_dispatch() {
        let provider = calc();
        // `int` is not declared for neg, but `long` accepts the value.
        let result = provider
            .invoke(&invoke("neg", vec![json!(4)], vec![ValueType::Int]))
            .await
            .unwrap();
        assert_eq!(result, json!(-4));

        let generic = Invoke::generic("Calc", "1.0", "neg", vec![json!(9)], vec!["com.acme.Num".into()]);
        assert_eq!(provider.invoke(&generic).await.unwrap(), json!(-9));
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let provider = calc();
        let err = provider
            .invoke(&invoke("mul", vec![json!(2), json!(3)], vec![ValueType::Int, ValueType::Int]))
            .await
            .unwrap_err();
        match err {
            RemotingError::MethodNotFound {
                service,
                method,
                params,
            } => {
                assert_eq!(service, "Calc:1.0");
                assert_eq!(method, "mul");
                assert_eq!(params, "int, int");
            }
            other => panic!("unexpected {:?}", other),
        }

        // Wrong arity is not a match either.
        let err = provider
            .invoke(&invoke("neg", vec![], vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemotingError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_generic_handler_catches_unresolved() {
        let provider = ServiceProvider::new("Orders", "2.0").generic(|method, args| async move {
            Ok(json!({ "method": method, "argc": args.len() }))
        });
        let call = Invoke::generic(
            "Orders",
            "2.0",
            "place",
            vec![json!({"sku": "x"})],
            vec!["com.acme.Order".into()],
        );
        let result = provider.invoke(&call).await.unwrap();
        assert_eq!(result, json!({"method": "place", "argc": 1}));
    }

    #[test]
    fn test_redefinition_replaces() {
        let provider = calc().sync_method("add", vec![ValueType::Int, ValueType::Int], |_| Ok(json!(0)));
        assert_eq!(provider.method_count(), 3);
        assert_eq!(
            provider.signatures(),
            vec!["add(int, int)", "add(double, double)", "neg(long)"]
        );
    }
}
