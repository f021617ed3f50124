//! Networked coordination store.
//!
//! A [`StoreServer`] shares one [`MemoryEnsemble`] over TCP, so providers and
//! consumers in different processes see the same tree. Every accepted socket
//! is one session: its ephemeral nodes live exactly as long as the socket.
//!
//! [`RemoteStore`] is the client side of a session. When the socket drops it
//! reports `Lost`, redials every `retry_interval` and reports `Reconnected`
//! on a fresh session, which is the cue for the registry to re-publish.
//!
//! Frames are JSON documents, one per line. A client opens with a `hello`
//! frame naming its namespace.

use crate::config::RegistryConfig;
use crate::error::StoreError;
use crate::memory::{MemoryEnsemble, MemoryStore};
use crate::store::{ConnectionState, CoordinationStore, CreateMode, StoreEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

type Outcome = Result<Option<Vec<u8>>, StoreError>;
type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Client to server frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Hello {
        namespace: String,
    },
    Create {
        id: u64,
        path: String,
        data: Vec<u8>,
        ephemeral: bool,
    },
    Delete {
        id: u64,
        path: String,
    },
    GetData {
        id: u64,
        path: String,
    },
    Children {
        id: u64,
        path: String,
    },
}

/// Server to client frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Reply {
    Done { id: u64, outcome: Outcome },
    Event { event: StoreEvent },
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = serde_json::to_vec(frame).map_err(|e| StoreError::Protocol(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

async fn write_frame<T: Serialize>(writer: &mut OwnedWriteHalf, frame: &T) -> Result<(), StoreError> {
    let bytes = encode(frame)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| StoreError::Io(e.to_string()))
}

/// Next frame, or `None` once the peer hung up.
async fn read_frame<T: DeserializeOwned>(lines: &mut LineReader) -> Result<Option<T>, StoreError> {
    match lines.next_line().await {
        Ok(Some(line)) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| StoreError::Protocol(e.to_string())),
        Ok(None) => Ok(None),
        Err(e) => Err(StoreError::Io(e.to_string())),
    }
}

/// Serves a [`MemoryEnsemble`] to [`RemoteStore`] clients.
pub struct StoreServer {
    ensemble: MemoryEnsemble,
}

impl StoreServer {
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self { ensemble }
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Accepts sessions until `shutdown` fires, then ends every session,
    /// removing their ephemeral nodes.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        tracing::info!("Coordination store listening on {}", listener.local_addr()?);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        sessions.spawn(serve_session(
                            self.ensemble.clone(),
                            socket,
                            peer,
                            shutdown.resubscribe(),
                        ));
                    }
                    Err(e) => tracing::warn!("Coordination store accept failed: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.recv() => break,
            }
        }
        while sessions.join_next().await.is_some() {}
        tracing::info!("Coordination store stopped");
        Ok(())
    }
}

async fn serve_session(
    ensemble: MemoryEnsemble,
    socket: TcpStream,
    peer: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    socket.set_nodelay(true).ok();
    let (read_half, mut writer) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let namespace = match read_frame::<Request>(&mut lines).await {
        Ok(Some(Request::Hello { namespace })) => namespace,
        Ok(Some(other)) => {
            tracing::warn!(%peer, ?other, "Store session did not open with hello");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Store handshake failed");
            return;
        }
    };

    let store = ensemble.connect(&namespace);
    let Some(mut events) = store.take_events() else {
        return;
    };
    if let Err(e) = store.start().await {
        tracing::warn!(%peer, error = %e, "Store session could not start");
        return;
    }
    tracing::debug!(%peer, %namespace, "Store session opened");

    loop {
        tokio::select! {
            frame = read_frame::<Request>(&mut lines) => {
                let request = match frame {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "Store session read failed");
                        break;
                    }
                };
                let Some(reply) = execute(&store, request).await else {
                    continue;
                };
                if write_frame(&mut writer, &reply).await.is_err() {
                    break;
                }
            }
            Some(event) = events.recv() => {
                // Each side tracks its own connection state.
                if matches!(event, StoreEvent::StateChanged(_)) {
                    continue;
                }
                if write_frame(&mut writer, &Reply::Event { event }).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    store.close().await;
    tracing::debug!(%peer, "Store session closed");
}

async fn execute(store: &MemoryStore, request: Request) -> Option<Reply> {
    let (id, outcome) = match request {
        Request::Hello { .. } => return None,
        Request::Create {
            id,
            path,
            data,
            ephemeral,
        } => {
            let mode = if ephemeral {
                CreateMode::Ephemeral
            } else {
                CreateMode::Persistent
            };
            (id, store.create(&path, &data, mode).await.map(|()| None))
        }
        Request::Delete { id, path } => (id, store.delete(&path).await.map(|()| None)),
        Request::GetData { id, path } => (id, store.get_data(&path).await.map(Some)),
        Request::Children { id, path } => (id, store.request_children(&path).await.map(|()| None)),
    };
    Some(Reply::Done { id, outcome })
}

/// A session against a [`StoreServer`] at `host:port`.
pub struct RemoteStore {
    shared: Arc<Shared>,
}

struct Shared {
    address: String,
    namespace: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    retry_interval: Duration,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: DashMap<u64, oneshot::Sender<Outcome>>,
    next_id: AtomicU64,
    started: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStore {
    /// An unstarted session against `config.connect_string`. Requests
    /// unanswered within the session timeout fail with connection loss.
    pub fn new(config: &RegistryConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                address: config.connect_string.clone(),
                namespace: config.namespace.clone(),
                connect_timeout: config.connect_timeout(),
                request_timeout: config.session_timeout(),
                retry_interval: config.retry_interval(),
                writer: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Shared {
    fn emit(&self, event: StoreEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn dial(&self) -> Result<(OwnedWriteHalf, LineReader), StoreError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| StoreError::ConnectTimeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| StoreError::Io(format!("connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true).ok();

        let (read_half, mut writer) = stream.into_split();
        let hello = Request::Hello {
            namespace: self.namespace.clone(),
        };
        write_frame(&mut writer, &hello).await?;
        Ok((writer, BufReader::new(read_half).lines()))
    }

    async fn call(&self, request: impl FnOnce(u64) -> Request) -> Outcome {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(StoreError::NotStarted);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&request(id))?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer
                    .write_all(&frame)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string())),
                None => Err(StoreError::ConnectionLoss),
            }
        };
        if let Err(e) = written {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StoreError::ConnectionLoss),
            Err(_) => {
                self.pending.remove(&id);
                Err(StoreError::ConnectionLoss)
            }
        }
    }

    fn dispatch(&self, reply: Reply) {
        match reply {
            Reply::Done { id, outcome } => {
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let _ = tx.send(outcome);
                }
            }
            Reply::Event { event } => self.emit(event),
        }
    }

    fn fail_pending(&self, err: StoreError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    async fn connection_lost(&self) {
        self.connected.store(false, Ordering::Release);
        self.writer.lock().await.take();
        self.fail_pending(StoreError::ConnectionLoss);
        tracing::warn!(address = %self.address, "Coordination store connection lost");
        self.emit(StoreEvent::StateChanged(ConnectionState::Lost));
    }
}

/// Reads replies for one socket after another until the store is closed.
async fn run_session(weak: Weak<Shared>, mut lines: LineReader) {
    loop {
        loop {
            let frame = read_frame::<Reply>(&mut lines).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match frame {
                Ok(Some(reply)) => shared.dispatch(reply),
                Ok(None) => break,
                Err(StoreError::Protocol(message)) => {
                    tracing::warn!(%message, "Skipping malformed store frame");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Coordination store read failed");
                    break;
                }
            }
        }

        let retry_interval = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            shared.connection_lost().await;
            shared.retry_interval
        };

        lines = loop {
            tokio::time::sleep(retry_interval).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            match shared.dial().await {
                Ok((writer, lines)) => {
                    *shared.writer.lock().await = Some(writer);
                    shared.connected.store(true, Ordering::Release);
                    tracing::info!(address = %shared.address, "Coordination store reconnected");
                    shared.emit(StoreEvent::StateChanged(ConnectionState::Reconnected));
                    break lines;
                }
                Err(e) => tracing::debug!(error = %e, "Coordination store redial failed"),
            }
        };
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn start(&self) -> Result<(), StoreError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut writer = shared.writer.lock().await;
        if shared.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let (write_half, lines) = shared.dial().await?;
        *writer = Some(write_half);
        drop(writer);

        shared.connected.store(true, Ordering::Release);
        shared.started.store(true, Ordering::Release);
        tracing::info!(
            address = %shared.address,
            namespace = %shared.namespace,
            "Coordination store session opened"
        );
        shared.emit(StoreEvent::StateChanged(ConnectionState::Connected));

        let reader = tokio::spawn(run_session(Arc::downgrade(shared), lines));
        *shared.reader.lock() = Some(reader);
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), StoreError> {
        let ephemeral = mode == CreateMode::Ephemeral;
        self.shared
            .call(|id| Request::Create {
                id,
                path: path.to_string(),
                data: data.to_vec(),
                ephemeral,
            })
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.shared
            .call(|id| Request::Delete {
                id,
                path: path.to_string(),
            })
            .await
            .map(|_| ())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.shared
            .call(|id| Request::GetData {
                id,
                path: path.to_string(),
            })
            .await
            .map(Option::unwrap_or_default)
    }

    async fn request_children(&self, path: &str) -> Result<(), StoreError> {
        self.shared
            .call(|id| Request::Children {
                id,
                path: path.to_string(),
            })
            .await
            .map(|_| ())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        self.shared.events_rx.lock().take()
    }

    async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reader = shared.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let writer = shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        shared.connected.store(false, Ordering::Release);
        shared.fail_pending(StoreError::Closed);
        tracing::debug!(address = %shared.address, "Coordination store session closed");
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{participant_path, DefaultServiceRegistry};
    use remoting_core::{ServiceParticipantInfo, ServiceRegistry};

    struct Hosted {
        address: String,
        ensemble: MemoryEnsemble,
        stop: broadcast::Sender<()>,
        task: JoinHandle<()>,
    }

    async fn host_on(ensemble: MemoryEnsemble, listener: TcpListener) -> Hosted {
        let address = listener.local_addr().unwrap().to_string();
        let (stop, rx) = broadcast::channel(1);
        let server = StoreServer::new(ensemble.clone());
        let task = tokio::spawn(async move {
            server.serve(listener, rx).await.unwrap();
        });
        Hosted {
            address,
            ensemble,
            stop,
            task,
        }
    }

    async fn host() -> Hosted {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        host_on(MemoryEnsemble::new(), listener).await
    }

    fn config(address: &str) -> RegistryConfig {
        RegistryConfig {
            connect_string: address.to_string(),
            connect_timeout_ms: 1_000,
            retry_interval_ms: 50,
            ..Default::default()
        }
    }

    async fn started(address: &str) -> RemoteStore {
        let store = RemoteStore::new(&config(address));
        store.start().await.unwrap();
        store
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<StoreEvent>,
        wanted: impl Fn(&StoreEvent) -> bool,
    ) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    #[test]
    fn test_frames_are_single_lines() {
        let frame = encode(&Reply::Done {
            id: 3,
            outcome: Err(StoreError::NoNode("/a\nb".into())),
        })
        .unwrap();
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(frame.last(), Some(&b'\n'));

        let text = String::from_utf8(frame).unwrap();
        match serde_json::from_str::<Reply>(text.trim_end()).unwrap() {
            Reply::Done { id, outcome } => {
                assert_eq!(id, 3);
                assert_eq!(outcome, Err(StoreError::NoNode("/a\nb".into())));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sessions_share_one_tree() {
        let hosted = host().await;
        let writer = started(&hosted.address).await;
        let reader = started(&hosted.address).await;
        let mut events = reader.take_events().unwrap();

        writer.create("/svc", b"", CreateMode::Persistent).await.unwrap();
        writer.create("/svc/p", b"doc", CreateMode::Ephemeral).await.unwrap();
        assert!(hosted.ensemble.exists("/remoting/svc/p"));

        assert_eq!(reader.get_data("/svc/p").await.unwrap(), b"doc".to_vec());
        assert_eq!(
            reader.create("/svc", b"", CreateMode::Persistent).await,
            Err(StoreError::NodeExists("/svc".into()))
        );

        reader.request_children("/svc").await.unwrap();
        let listing = wait_for(&mut events, |e| matches!(e, StoreEvent::Children { .. })).await;
        assert_eq!(
            listing,
            StoreEvent::Children {
                path: "/svc".into(),
                children: vec!["p".into()],
            }
        );

        // The writer's socket going away ends its session and fires the watch.
        writer.close().await;
        wait_for(&mut events, |e| matches!(e, StoreEvent::Watched { .. })).await;
        eventually(|| !hosted.ensemble.exists("/remoting/svc/p")).await;
        assert!(hosted.ensemble.exists("/remoting/svc"));
    }

    #[tokio::test]
    async fn test_operations_outside_a_session() {
        let hosted = host().await;
        let store = RemoteStore::new(&config(&hosted.address));
        assert_eq!(store.delete("/x").await, Err(StoreError::NotStarted));

        store.start().await.unwrap();
        store.start().await.unwrap();
        assert!(store.is_connected());
        eventually(|| hosted.ensemble.session_count() == 1).await;

        store.close().await;
        assert!(!store.is_connected());
        assert_eq!(store.request_children("/").await, Err(StoreError::Closed));
        assert_eq!(store.start().await, Err(StoreError::Closed));
        eventually(|| hosted.ensemble.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = RemoteStore::new(&config(&address));
        assert!(matches!(store.start().await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_server_shutdown_reports_lost() {
        let hosted = host().await;
        let store = started(&hosted.address).await;
        let mut events = store.take_events().unwrap();
        store.create("/e", b"", CreateMode::Ephemeral).await.unwrap();

        hosted.stop.send(()).unwrap();
        hosted.task.await.unwrap();
        assert!(!hosted.ensemble.exists("/remoting/e"));

        wait_for(&mut events, |e| {
            *e == StoreEvent::StateChanged(ConnectionState::Lost)
        })
        .await;
        assert!(!store.is_connected());
        assert_eq!(
            store.create("/e", b"", CreateMode::Ephemeral).await,
            Err(StoreError::ConnectionLoss)
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_discovery_across_sessions() {
        let hosted = host().await;
        let provider_side = DefaultServiceRegistry::new(
            Arc::new(RemoteStore::new(&config(&hosted.address))),
            config(&hosted.address),
        );
        let consumer_side = DefaultServiceRegistry::new(
            Arc::new(RemoteStore::new(&config(&hosted.address))),
            config(&hosted.address),
        );

        let provider =
            ServiceParticipantInfo::provider("Calc:1.0", "10.0.0.1", 8700).with_metadata("zone", "eu-1");
        provider_side.register_participant(provider.clone()).await.unwrap();
        consumer_side
            .register_participant(ServiceParticipantInfo::consumer("Calc:1.0", "10.0.0.2", 0))
            .await
            .unwrap();

        let providers = consumer_side.get_providers("Calc:1.0").await.unwrap();
        assert_eq!(*providers, vec![provider.clone()]);
        assert_eq!(providers[0].metadata["zone"], "eu-1");

        provider_side.close().await;
        eventually(|| {
            consumer_side
                .cached_providers("Calc:1.0")
                .map(|p| p.is_empty())
                .unwrap_or(false)
        })
        .await;
        consumer_side.close().await;
    }

    #[tokio::test]
    async fn test_registry_republishes_after_server_restart() {
        let hosted = host().await;
        let address = hosted.address.clone();
        let ensemble = hosted.ensemble.clone();
        let registry = DefaultServiceRegistry::new(
            Arc::new(RemoteStore::new(&config(&address))),
            config(&address),
        );
        let provider = ServiceParticipantInfo::provider("Calc:1.0", "10.0.0.1", 8700);
        registry.register_participant(provider.clone()).await.unwrap();
        let node = format!("/remoting{}", participant_path(&provider).unwrap());
        assert!(ensemble.exists(&node));

        hosted.stop.send(()).unwrap();
        hosted.task.await.unwrap();
        assert!(!ensemble.exists(&node));

        let listener = TcpListener::bind(&address).await.unwrap();
        let restarted = host_on(ensemble.clone(), listener).await;
        eventually(|| ensemble.exists(&node)).await;

        registry.close().await;
        restarted.stop.send(()).unwrap();
        restarted.task.await.unwrap();
    }
}
