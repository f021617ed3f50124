//! Provider-side TCP server.
//!
//! Each accepted socket gets a [`Session`] task. Requests are dispatched on
//! their own tasks so a slow method never stalls the socket; finished results
//! come back to the session over a channel and are written in completion
//! order. Heartbeats and refusals are answered inline.

use crate::config::Config;
use crate::dispatcher::{Dispatcher, ServerInvokeFilterChain};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::provider::ServiceProvider;
use remoting_core::{
    HeartbeatMessage, Invoke, InvokeFilter, InvokeResult, Message, ServiceParticipantInfo,
    ServiceRegistry, ServiceTarget,
};
use remoting_protocol::{ByteBuffer, Codec, FrameDecoder, ProtocolError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Completed results a session may queue before dispatch tasks wait.
const REPLY_QUEUE_DEPTH: usize = 256;

const READ_CHUNK: usize = 8192;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Host published in provider records. Defaults to the bound IP.
    pub advertise_host: Option<String>,
    /// A session with no traffic for this long is closed.
    pub idle_timeout: Duration,
    pub max_connections: usize,
    /// Requests dispatched at once across every session.
    pub max_inflight: usize,
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("advertise_host", &self.advertise_host)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_inflight", &self.max_inflight)
            .field("with_metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    /// Defaults listening on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Takes the network section of a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        let network = &config.network;
        Self {
            bind_addr: network.bind_addr,
            advertise_host: network.advertise_host.clone(),
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            max_inflight: network.max_inflight,
            metrics: None,
        }
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Process-local counters, kept whether or not Prometheus is enabled.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub heartbeats_total: AtomicU64,
}

impl ServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Accounts one live connection; released on drop.
struct ConnectionSlot {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionSlot {
    fn open(stats: Arc<ServerStats>, metrics: Option<Arc<Metrics>>) -> Self {
        ServerStats::bump(&stats.connections_total);
        ServerStats::bump(&stats.connections_active);
        if let Some(m) = &metrics {
            m.connections_total.inc();
            m.connections_active.inc();
        }
        Self { stats, metrics }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.connections_active.dec();
        }
    }
}

/// Provider-side TCP server.
pub struct Server {
    config: ServerConfig,
    codec: Codec,
    dispatcher: Arc<Dispatcher>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_filters(config, Vec::new())
    }

    /// Requests pass through `filters`, in order, before reaching a service.
    pub fn with_filters(config: ServerConfig, filters: Vec<Arc<dyn InvokeFilter>>) -> Self {
        let chain = ServerInvokeFilterChain::new(filters);
        let dispatcher = match &config.metrics {
            Some(m) => Dispatcher::new(chain, config.max_inflight).with_metrics(m.clone()),
            None => Dispatcher::new(chain, config.max_inflight),
        };
        Self {
            config,
            codec: Codec::default(),
            dispatcher: Arc::new(dispatcher),
            registry: None,
            stats: Arc::default(),
            shutdown: broadcast::channel(1).0,
            running: AtomicBool::new(false),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Publishes exported services to `registry`.
    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Binds the listener. Exports made after this advertise the bound port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        *self.local_addr.lock() = Some(listener.local_addr()?);
        Ok(listener)
    }

    /// Binds and serves until [`Server::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts sessions on `listener` until [`Server::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);
        let mut stop = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Serving {} service(s) on {}",
            self.dispatcher.services().len(),
            bound
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.recv() => break,
            };
            match accepted {
                Ok((socket, peer)) => self.admit(socket, peer),
                Err(e) => tracing::error!("Failed to accept connection: {}", e),
            }
        }

        tracing::info!("Stopped accepting on {}", bound);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn admit(&self, socket: TcpStream, peer: SocketAddr) {
        if self.stats.active_connections() >= self.config.max_connections as u64 {
            tracing::warn!(
                "Refusing {}: {} connections open",
                peer,
                self.config.max_connections
            );
            return;
        }

        let slot = ConnectionSlot::open(self.stats.clone(), self.config.metrics.clone());
        let session = Session::new(
            socket,
            peer,
            self.codec.clone(),
            self.dispatcher.clone(),
            self.stats.clone(),
            &self.config,
        );
        let stop = self.shutdown.subscribe();

        tokio::spawn(async move {
            tracing::info!("Session opened: {}", peer);
            match session.run(stop).await {
                Ok(()) => tracing::info!("Session closed: {}", peer),
                Err(e) => {
                    ServerStats::bump(&slot.stats.errors_total);
                    tracing::info!("Session {} ended: {}", peer, e);
                }
            }
            drop(slot);
        });
    }

    /// Binds `provider` and publishes it when a registry is configured.
    pub async fn export(&self, provider: ServiceProvider) -> Result<(), ServerError> {
        let metadata = provider.metadata().clone();
        self.export_target(Arc::new(provider), metadata).await
    }

    /// Binds any [`ServiceTarget`] and publishes it with `metadata`.
    ///
    /// A failed publication leaves the service unexported.
    pub async fn export_target(
        &self,
        target: Arc<dyn ServiceTarget>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ServerError> {
        let service_name = target.service_name().to_string();
        self.dispatcher.export(target)?;
        tracing::info!("Exported {}", service_name);

        let Some(registry) = &self.registry else {
            return Ok(());
        };
        let mut record = ServiceParticipantInfo::provider(
            service_name.as_str(),
            self.advertised_host(),
            self.port(),
        );
        record.metadata = metadata;
        if let Err(e) = registry.register_participant(record).await {
            self.dispatcher.unexport(&service_name);
            return Err(e.into());
        }
        tracing::info!(
            "Published provider {} at {}",
            service_name,
            self.advertised_address()
        );
        Ok(())
    }

    pub fn advertised_host(&self) -> String {
        self.config
            .advertise_host
            .clone()
            .unwrap_or_else(|| self.local_addr().ip().to_string())
    }

    /// `host:port` published in provider records.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.advertised_host(), self.port())
    }

    /// Bound address once listening, the configured one before.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr.lock().unwrap_or(self.config.bind_addr)
    }

    pub fn port(&self) -> u16 {
        self.local_addr().port()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> Option<&Arc<dyn ServiceRegistry>> {
        self.registry.as_ref()
    }

    /// Stops the accept loop and every open session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Fires when [`Server::shutdown`] is called.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// One accepted socket.
struct Session {
    socket: TcpStream,
    peer: SocketAddr,
    codec: Codec,
    decoder: FrameDecoder,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
    idle_timeout: Duration,
    last_seen: Instant,
    replies_tx: mpsc::Sender<InvokeResult>,
    replies_rx: mpsc::Receiver<InvokeResult>,
}

impl Session {
    fn new(
        socket: TcpStream,
        peer: SocketAddr,
        codec: Codec,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<ServerStats>,
        config: &ServerConfig,
    ) -> Self {
        socket.set_nodelay(true).ok();
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        Self {
            socket,
            peer,
            decoder: FrameDecoder::new(codec.clone()),
            codec,
            dispatcher,
            stats,
            metrics: config.metrics.clone(),
            idle_timeout: config.idle_timeout,
            last_seen: Instant::now(),
            replies_tx,
            replies_rx,
        }
    }

    async fn run(mut self, mut stop: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let idle_deadline =
                tokio::time::Instant::from_std(self.last_seen + self.idle_timeout);
            tokio::select! {
                biased;

                Some(result) = self.replies_rx.recv() => {
                    self.write(&result.into()).await?;
                }

                read = self.socket.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        tracing::debug!("[{}] Peer closed the socket", self.peer);
                        return Ok(());
                    }
                    tracing::trace!("[{}] Read {} bytes", self.peer, n);
                    self.last_seen = Instant::now();
                    self.decoder.extend(&chunk[..n]);
                    self.drain_frames().await?;
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::debug!("[{}] Idle for {:?}, closing", self.peer, self.idle_timeout);
                    return Ok(());
                }

                _ = stop.recv() => return Err(ServerError::ShuttingDown),
            }
        }
    }

    async fn drain_frames(&mut self) -> Result<(), ServerError> {
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) => self.handle(msg).await?,
                Ok(None) => return Ok(()),
                // The stream cannot be realigned past a bad length field.
                Err(e @ ProtocolError::InvalidBodyLength { .. }) => {
                    tracing::warn!("[{}] {}", self.peer, e);
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!("[{}] Dropping frame: {}", self.peer, e);
                    ServerStats::bump(&self.stats.errors_total);
                    if let Some(id) = e.message_id() {
                        self.write(&InvokeResult::error(id, e.to_string()).into())
                            .await?;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: Message) -> Result<(), ServerError> {
        match msg {
            Message::Invoke(invoke) => self.accept_invoke(invoke).await,
            Message::Heartbeat(hb) if hb.is_ping() => {
                ServerStats::bump(&self.stats.heartbeats_total);
                if let Some(m) = &self.metrics {
                    m.heartbeats_total.inc();
                }
                self.write(&HeartbeatMessage::pong(hb.id).into()).await
            }
            Message::Heartbeat(hb) => {
                tracing::trace!("[{}] Pong id={}", self.peer, hb.id);
                Ok(())
            }
            Message::Result(result) => {
                tracing::warn!("[{}] Unsolicited response id={}", self.peer, result.id);
                Ok(())
            }
        }
    }

    async fn accept_invoke(&mut self, mut invoke: Invoke) -> Result<(), ServerError> {
        ServerStats::bump(&self.stats.requests_total);
        invoke.remote_address = Some(self.peer.to_string());
        tracing::debug!(
            "[{}] {}#{} id={}",
            self.peer,
            invoke.service_name(),
            invoke.method_name(),
            invoke.id
        );

        let Some(permit) = self.dispatcher.try_acquire() else {
            if !invoke.two_way {
                return Ok(());
            }
            let refusal = self.dispatcher.busy(&invoke);
            return self.write(&refusal.into()).await;
        };

        let dispatcher = self.dispatcher.clone();
        let replies = self.replies_tx.clone();
        tokio::spawn(async move {
            let two_way = invoke.two_way;
            let result = dispatcher.dispatch(invoke).await;
            drop(permit);
            if two_way {
                // The session may already be gone.
                let _ = replies.send(result).await;
            }
        });
        Ok(())
    }

    async fn write(&mut self, msg: &Message) -> Result<(), ServerError> {
        let frame = encode_or_fallback(&self.codec, msg)?;
        self.socket.write_all(frame.readable()).await?;
        self.last_seen = Instant::now();
        Ok(())
    }
}

/// Encodes `msg`. A result its serializer cannot carry is replaced by an
/// error result with the same id.
fn encode_or_fallback(codec: &Codec, msg: &Message) -> Result<ByteBuffer, ServerError> {
    let err = match codec.encode_to_buffer(msg) {
        Ok(frame) => return Ok(frame),
        Err(e) => e,
    };
    let Message::Result(result) = msg else {
        return Err(err.into());
    };
    tracing::warn!("Failed to encode response id={}: {}", result.id, err);
    let fallback = InvokeResult::error(result.id, err.to_string());
    Ok(codec.encode_to_buffer(&fallback.into())?)
}
