//! Registry client backed by a coordination store.

use crate::config::RegistryConfig;
use crate::error::StoreError;
use crate::store::{ConnectionState, CoordinationStore, CreateMode, StoreEvent, WatchedEventType};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use remoting_core::{RemotingError, ServiceParticipantInfo, ServiceRegistry};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

const PROVIDERS: &str = "providers";
const CONSUMERS: &str = "consumers";

/// Init latch state for a service whose first provider listing is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Latch {
    Pending,
    Released,
    Cancelled,
}

/// Escapes a participant document into a single path segment.
pub fn encode_node_name(document: &str) -> String {
    let mut out = String::with_capacity(document.len());
    for c in document.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`encode_node_name`].
pub fn decode_node_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let escape = rest.get(idx..idx + 3);
        match escape {
            Some("%25") => out.push('%'),
            Some("%2F") | Some("%2f") => out.push('/'),
            _ => {
                out.push('%');
                rest = &rest[idx + 1..];
                continue;
            }
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    out
}

pub fn provider_path(service_name: &str) -> String {
    format!("/{}/{}", service_name, PROVIDERS)
}

/// Path of the ephemeral node publishing `participant`. The name carries
/// the identity fields only; the full document is the node's data.
pub fn participant_path(participant: &ServiceParticipantInfo) -> Result<String, RemotingError> {
    let document = participant
        .identity_document()
        .map_err(|e| RemotingError::Registry(format!("invalid participant: {}", e)))?;
    let group = if participant.is_provider() {
        PROVIDERS
    } else {
        CONSUMERS
    };
    Ok(format!(
        "/{}/{}/{}",
        participant.service_name,
        group,
        encode_node_name(&document)
    ))
}

fn service_of_provider_path(path: &str) -> Option<&str> {
    path.strip_prefix('/')?
        .strip_suffix(PROVIDERS)?
        .strip_suffix('/')
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    config: RegistryConfig,
    cached_providers: DashMap<String, Arc<Vec<ServiceParticipantInfo>>>,
    init_latches: DashMap<String, watch::Sender<Latch>>,
    local_participants: RwLock<Arc<Vec<ServiceParticipantInfo>>>,
    lifecycle: AtomicU8,
    start_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// [`ServiceRegistry`] publishing participants as ephemeral store nodes and
/// caching provider lists per service.
///
/// Cloning shares the session.
#[derive(Clone)]
pub struct DefaultServiceRegistry {
    inner: Arc<Inner>,
}

impl DefaultServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                cached_providers: DashMap::new(),
                init_latches: DashMap::new(),
                local_participants: RwLock::new(Arc::new(Vec::new())),
                lifecycle: AtomicU8::new(NOT_STARTED),
                start_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Opens the store session and starts the event pump. Runs at most once.
    pub async fn start(&self) -> Result<(), RemotingError> {
        self.inner.start().await
    }

    pub fn is_started(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == STARTED
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == CLOSED
    }

    /// Snapshot of the participants registered through this registry.
    pub fn local_participants(&self) -> Arc<Vec<ServiceParticipantInfo>> {
        self.inner.local_participants.read().clone()
    }

    /// Cached providers without waiting for a pending first listing.
    pub fn cached_providers(&self, service_name: &str) -> Option<Arc<Vec<ServiceParticipantInfo>>> {
        self.inner
            .cached_providers
            .get(service_name)
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ServiceRegistry for DefaultServiceRegistry {
    async fn register_participant(
        &self,
        participant: ServiceParticipantInfo,
    ) -> Result<(), RemotingError> {
        self.inner.ensure_open()?;
        if self.inner.local_participants.read().contains(&participant) {
            return Ok(());
        }

        self.inner.start().await?;
        self.inner.init_service_path(&participant.service_name).await?;
        self.inner.publish(&participant).await?;
        if participant.is_consumer() {
            let service_name = &participant.service_name;
            self.inner
                .init_latches
                .entry(service_name.clone())
                .or_insert_with(|| watch::channel(Latch::Pending).0);
            if let Err(e) = self.inner.subscribe(&provider_path(service_name)).await {
                if let Some((_, latch)) = self.inner.init_latches.remove(service_name) {
                    let _ = latch.send(Latch::Cancelled);
                }
                return Err(e);
            }
        }

        // Recorded only once published, so recovery never re-publishes a
        // participant whose registration failed.
        let mut local = self.inner.local_participants.write();
        if !local.contains(&participant) {
            let mut next = Vec::with_capacity(local.len() + 1);
            next.extend(local.iter().cloned());
            next.push(participant);
            *local = Arc::new(next);
        }
        Ok(())
    }

    async fn get_providers(
        &self,
        service_name: &str,
    ) -> Result<Arc<Vec<ServiceParticipantInfo>>, RemotingError> {
        self.inner.ensure_open()?;
        if let Some(providers) = self.cached_providers(service_name) {
            return Ok(providers);
        }

        let latch = self
            .inner
            .init_latches
            .get(service_name)
            .map(|tx| tx.subscribe());
        let Some(mut latch) = latch else {
            // The first listing may have landed between the two reads.
            return self.cached_providers(service_name).ok_or_else(|| {
                RemotingError::Registry(format!(
                    "service {} is not subscribed to providers",
                    service_name
                ))
            });
        };

        loop {
            let state = *latch.borrow_and_update();
            match state {
                Latch::Released => break,
                Latch::Cancelled => {
                    return Err(RemotingError::Registry(format!(
                        "waiting for providers of {} was cancelled",
                        service_name
                    )))
                }
                Latch::Pending => {}
            }
            if latch.changed().await.is_err() {
                break;
            }
        }

        self.cached_providers(service_name).ok_or_else(|| {
            RemotingError::Registry(format!("no provider listing for {}", service_name))
        })
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), RemotingError> {
        if self.lifecycle.load(Ordering::Acquire) == CLOSED {
            return Err(RemotingError::Registry("registry closed".to_string()));
        }
        Ok(())
    }

    async fn start(self: &Arc<Self>) -> Result<(), RemotingError> {
        let _guard = self.start_lock.lock().await;
        match self.lifecycle.load(Ordering::Acquire) {
            STARTED => return Ok(()),
            CLOSED => return Err(RemotingError::Registry("registry closed".to_string())),
            _ => {}
        }

        self.connect().await?;
        let events = self
            .store
            .take_events()
            .ok_or_else(|| RemotingError::Registry("store events already taken".to_string()))?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_event_pump(Arc::downgrade(self), events)));
        if self.config.close_on_shutdown_signal {
            let weak = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        tracing::info!("Shutdown signal received, closing registry session");
                        inner.close().await;
                    }
                }
            }));
        }
        self.tasks.lock().extend(tasks);

        // A close that landed while connecting wins.
        if self
            .lifecycle
            .compare_exchange(NOT_STARTED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            return Err(RemotingError::Registry("registry closed".to_string()));
        }

        tracing::info!(
            namespace = %self.config.namespace,
            connect = %self.config.connect_string,
            session_timeout_ms = self.config.session_timeout_ms,
            "Registry started"
        );
        Ok(())
    }

    /// Opens the store session, retrying until the connect timeout elapses.
    async fn connect(&self) -> Result<(), RemotingError> {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let attempt = tokio::time::timeout(remaining, self.store.start()).await;
            let err = match attempt {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(StoreError::Closed)) => return Err(StoreError::Closed.into()),
                Ok(Err(e)) => e,
                Err(_) => StoreError::ConnectTimeout(self.config.connect_timeout_ms),
            };
            if tokio::time::Instant::now() + self.config.retry_interval() >= deadline {
                return Err(err.into());
            }
            tracing::warn!(error = %err, "Registry connect failed, retrying");
            tokio::time::sleep(self.config.retry_interval()).await;
        }
    }

    async fn close(&self) {
        if self.lifecycle.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        self.store.close().await;

        let services: Vec<String> = self
            .init_latches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for service in services {
            if let Some((_, latch)) = self.init_latches.remove(&service) {
                let _ = latch.send(Latch::Cancelled);
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Registry closed");
    }

    async fn create_ignoring_existing(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<(), StoreError> {
        match self.store.create(path, data, mode).await {
            Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn init_service_path(&self, service_name: &str) -> Result<(), RemotingError> {
        let root = format!("/{}", service_name);
        self.create_ignoring_existing(&root, b"", CreateMode::Persistent)
            .await?;
        for group in [PROVIDERS, CONSUMERS] {
            let path = format!("{}/{}", root, group);
            self.create_ignoring_existing(&path, b"", CreateMode::Persistent)
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, participant: &ServiceParticipantInfo) -> Result<(), RemotingError> {
        let path = participant_path(participant)?;
        let document = participant
            .to_document()
            .map_err(|e| RemotingError::Registry(format!("invalid participant: {}", e)))?;
        // A node left by a previous session may still be present.
        match self.store.delete(&path).await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.create_ignoring_existing(&path, document.as_bytes(), CreateMode::Ephemeral)
            .await?;
        tracing::info!(
            service = %participant.service_name,
            participant_type = %participant.participant_type,
            address = %participant.address(),
            "Published participant"
        );
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<(), RemotingError> {
        self.store.request_children(path).await?;
        Ok(())
    }

    async fn handle_event(&self, event: StoreEvent, last_state: &mut Option<ConnectionState>) {
        tracing::debug!(?event, "Registry event");
        match event {
            StoreEvent::Watched {
                path,
                event_type: WatchedEventType::NodeChildrenChanged,
            } => {
                if let Err(e) = self.subscribe(&path).await {
                    tracing::error!(%path, error = %e, "Re-subscribing to children failed");
                }
            }
            StoreEvent::Watched { .. } => {}
            StoreEvent::Children { path, children } => {
                if let Some(service_name) = service_of_provider_path(&path) {
                    self.refresh_providers(service_name, &children).await;
                }
            }
            StoreEvent::StateChanged(state) => self.state_changed(state, last_state).await,
            StoreEvent::Error { message } => {
                tracing::error!(%message, "Unhandled coordination store error");
            }
        }
    }

    /// Reads every listed provider node and replaces the cached list in one
    /// step. Nodes without data are parsed from their name.
    async fn refresh_providers(&self, service_name: &str, children: &[String]) {
        let root = provider_path(service_name);
        let mut providers = Vec::with_capacity(children.len());
        for name in children {
            let data = match self.store.get_data(&format!("{}/{}", root, name)).await {
                Ok(data) => data,
                // Gone since the listing; the watch reports it.
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => {
                    tracing::debug!(%service_name, node = %name, error = %e, "Reading provider node failed");
                    Vec::new()
                }
            };
            let document = String::from_utf8(data)
                .ok()
                .filter(|document| !document.is_empty())
                .unwrap_or_else(|| decode_node_name(name));
            match ServiceParticipantInfo::from_document(&document) {
                Ok(info) => providers.push(info),
                Err(e) => {
                    tracing::warn!(%service_name, node = %name, error = %e, "Skipping unparsable provider node");
                }
            }
        }
        let count = providers.len();
        self.cached_providers
            .insert(service_name.to_string(), Arc::new(providers));

        if let Some((_, latch)) = self.init_latches.remove(service_name) {
            let _ = latch.send(Latch::Released);
        }
        tracing::info!(%service_name, providers = count, "Received providers");
    }

    async fn state_changed(&self, state: ConnectionState, last_state: &mut Option<ConnectionState>) {
        match state {
            ConnectionState::Connected => {
                *last_state = Some(state);
            }
            ConnectionState::Lost => {
                tracing::warn!("Registry session lost");
                *last_state = Some(state);
            }
            ConnectionState::Reconnected => {
                if *last_state == Some(ConnectionState::Lost) {
                    self.recover().await;
                }
                *last_state = Some(state);
            }
            ConnectionState::Suspended | ConnectionState::ReadOnly => {
                tracing::debug!(?state, "Registry connection state changed");
            }
        }
    }

    /// Re-subscribes every local consumer and re-publishes every local
    /// participant on a fresh session.
    async fn recover(&self) {
        let participants = self.local_participants.read().clone();
        tracing::info!(participants = participants.len(), "Recovering registry session");
        for participant in participants.iter() {
            if participant.is_consumer() {
                let path = provider_path(&participant.service_name);
                if let Err(e) = self.subscribe(&path).await {
                    tracing::error!(%path, error = %e, "Re-subscribing after session loss failed");
                }
            }
            if let Err(e) = self.publish(participant).await {
                tracing::error!(
                    service = %participant.service_name,
                    error = %e,
                    "Re-publishing after session loss failed"
                );
            }
        }
    }
}

async fn run_event_pump(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
    let mut last_state = None;
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.lifecycle.load(Ordering::Acquire) == CLOSED {
            break;
        }
        inner.handle_event(event, &mut last_state).await;
    }
    tracing::debug!("Registry event pump stopped");
}
