//! remoting - provider daemon
//!
//! Serves the built-in echo service over the remoting frame protocol and
//! optionally publishes it to the service registry. It can also host the
//! coordination store other processes register with.

use remoting_core::{RemotingError, ServiceRegistry, ValueType};
use remoting_registry::{
    CoordinationStore, DefaultServiceRegistry, MemoryEnsemble, RemoteStore, StoreServer,
};
use remoting_server::{run_metrics_server, Config, Metrics, Server, ServerConfig, ServiceProvider};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn echo_service() -> ServiceProvider {
    ServiceProvider::new("remoting.Echo", "1.0")
        .with_metadata("builtin", "true")
        .sync_method("echo", vec![ValueType::String], |args| {
            match args.into_iter().next() {
                Some(Value::String(s)) => Ok(Value::String(s)),
                _ => Err(RemotingError::Invocation("echo expects a string".into())),
            }
        })
        .sync_method("ping", vec![], |_| Ok(Value::String("pong".into())))
}

fn create_registry(config: &Config, ensemble: &MemoryEnsemble) -> Arc<DefaultServiceRegistry> {
    let store = &config.registry.store;
    let session: Arc<dyn CoordinationStore> = if store.is_in_process() {
        Arc::new(ensemble.connect(&store.namespace))
    } else {
        Arc::new(RemoteStore::new(store))
    };
    Arc::new(DefaultServiceRegistry::new(session, store.clone()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if REMOTING_CONFIG is set, then env overrides)
    let config_path = std::env::var("REMOTING_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting remoting provider");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max in-flight requests: {}", config.network.max_inflight);

    let mut server_config = ServerConfig::from_config(&config);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    // Backs both `connect_string: memory` and the hosted store.
    let ensemble = MemoryEnsemble::new();

    let registry = if config.registry.enabled {
        let registry = create_registry(&config, &ensemble);
        tracing::info!(
            "  Registry: {} (namespace '{}')",
            config.registry.store.connect_string,
            config.registry.store.namespace
        );
        Some(registry)
    } else {
        tracing::info!("  Registry: disabled");
        None
    };

    let mut server = Server::new(server_config);
    if let Some(ref registry) = registry {
        server = server.with_registry(registry.clone());
    }
    let server = Arc::new(server);

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    let store_handle = match config.registry.store_listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("  Coordination store: {}", addr);
            let store_server = StoreServer::new(ensemble.clone());
            let shutdown = server.subscribe_shutdown();
            Some(tokio::spawn(async move {
                if let Err(e) = store_server.serve(listener, shutdown).await {
                    tracing::error!("Coordination store error: {}", e);
                }
            }))
        }
        None => None,
    };

    // Bind first so the published provider record carries the real port
    let listener = server.bind().await?;
    server.export(echo_service()).await?;

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Serve (blocks until shutdown)
    server.serve(listener).await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    if let Some(registry) = registry {
        registry.close().await;
    }
    if let Some(handle) = store_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
