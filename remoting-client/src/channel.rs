//! Message channel: connection pool plus request/response correlation.

use crate::connection::{normalize_address, ChannelConfig, Connection, ConnectionEvents};
use dashmap::DashMap;
use remoting_core::{InvokeResult, Message, RemotingError};
use remoting_protocol::{Codec, ProtocolError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

type Completion = Result<InvokeResult, RemotingError>;

struct PendingRequest {
    sender: oneshot::Sender<Completion>,
    /// Id of the connection the request was written to.
    connection: u64,
}

/// Sends messages to peers and correlates two-way responses by message id.
///
/// One connection is kept per `host:port`. Concurrent senders to an address
/// that has no active connection race on a per-address lock, so at most one
/// connection is established for it.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ChannelConfig,
    codec: Codec,
    connections: DashMap<String, Arc<Connection>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    pending: DashMap<i64, PendingRequest>,
    closed: AtomicBool,
    connects: AtomicUsize,
    this: Weak<ChannelInner>,
}

impl MessageChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_codec(config, Codec::default())
    }

    pub fn with_codec(config: ChannelConfig, codec: Codec) -> Self {
        let inner = Arc::new_cyclic(|this| ChannelInner {
            config,
            codec,
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Writes `msg` to its remote address.
    ///
    /// Two-way messages return a [`MessageFuture`] registered under the
    /// message id before the write; a failed write completes that future
    /// with the error. One-way messages return `None` and surface write
    /// errors directly.
    pub async fn send(&self, msg: Message) -> Result<Option<MessageFuture>, RemotingError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(RemotingError::Closed);
        }
        let address = match msg.remote_address() {
            Some(address) => normalize_address(address),
            None => {
                return Err(RemotingError::Transport(format!(
                    "message {} has no remote address",
                    msg.id()
                )))
            }
        };

        let conn = inner.connection(&address).await?;

        let two_way = msg.is_two_way() && !msg.is_heartbeat();
        if !two_way {
            conn.send(&msg).await?;
            return Ok(None);
        }

        let id = msg.id();
        let timeout = match msg.timeout() {
            t if t.is_zero() => inner.config.default_timeout,
            t => t,
        };
        let (sender, receiver) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingRequest {
                sender,
                connection: conn.id(),
            },
        );
        let future = MessageFuture {
            id,
            address,
            timeout,
            receiver,
            channel: inner.this.clone(),
        };

        if let Err(e) = conn.send(&msg).await {
            inner.complete(id, Err(e));
        }
        Ok(Some(future))
    }

    /// Completes the pending request with the same id. Returns `false` when
    /// nothing was waiting for it.
    pub fn deliver(&self, result: InvokeResult) -> bool {
        self.inner.deliver(result)
    }

    /// Closes every connection and fails every pending request with
    /// [`RemotingError::Closed`]. Later sends fail immediately.
    pub async fn close(&self) {
        self.inner.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of pooled connections, active or not.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of connections established over the channel's lifetime.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn active_connection(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(address)
            .map(|entry| entry.value().clone())
            .filter(|conn| conn.is_active())
    }

    async fn connection(&self, address: &str) -> Result<Arc<Connection>, RemotingError> {
        if let Some(conn) = self.active_connection(address) {
            return Ok(conn);
        }

        let lock = self
            .connect_locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.is_closed() {
            return Err(RemotingError::Closed);
        }
        if let Some(conn) = self.active_connection(address) {
            return Ok(conn);
        }

        let events: Weak<dyn ConnectionEvents> = self.this.clone();
        let conn = match Connection::connect(address, &self.config, self.codec.clone(), events).await {
            Ok(conn) => conn,
            Err(e) => {
                drop(_guard);
                drop(lock);
                self.release_connect_lock(address);
                return Err(e);
            }
        };
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(address.to_string(), conn.clone());
        tracing::info!("Connected to {}", address);
        Ok(conn)
    }

    /// Forgets the per-address lock unless a connector is holding it.
    fn release_connect_lock(&self, address: &str) {
        self.connect_locks
            .remove_if(address, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn complete(&self, id: i64, completion: Completion) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(completion);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, result: InvokeResult) -> bool {
        let id = result.id;
        let delivered = self.complete(id, Ok(result));
        if !delivered {
            tracing::debug!("Dropping response id={} with no pending request", id);
        }
        delivered
    }

    fn fail_connection(&self, connection: &Connection, err: &RemotingError) {
        let ids: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection == connection.id())
            .map(|entry| *entry.key())
            .collect();
        if !ids.is_empty() {
            tracing::debug!(
                "Failing {} pending requests to {}",
                ids.len(),
                connection.address()
            );
        }
        for id in ids {
            self.complete(id, Err(err.clone()));
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing message channel");

        let conns: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for conn in conns {
            conn.close().await;
        }
        self.connect_locks.clear();

        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        tracing::debug!("Clearing {} pending requests", ids.len());
        for id in ids {
            self.complete(id, Err(RemotingError::Closed));
        }
    }
}

impl ConnectionEvents for ChannelInner {
    fn on_message(&self, connection: &Arc<Connection>, msg: Message) {
        match msg {
            Message::Result(result) => {
                self.deliver(result);
            }
            other => {
                tracing::warn!(
                    "Ignoring unexpected message id={} from {}",
                    other.id(),
                    connection.address()
                );
            }
        }
    }

    fn on_decode_error(&self, connection: &Arc<Connection>, err: ProtocolError) {
        if let Some(id) = err.message_id() {
            if self.complete(id, Err(err.into())) {
                tracing::debug!("Failed request id={} from {} on decode error", id, connection.address());
            }
        }
    }

    fn on_closed(&self, connection: &Connection) {
        let address = connection.address();
        self.connections
            .remove_if(address, |_, pooled| pooled.id() == connection.id());
        self.release_connect_lock(address);
        if self.is_closed() {
            // close() fails whatever is left with Closed.
            return;
        }
        tracing::info!("Connection to {} closed", address);
        self.fail_connection(
            connection,
            &RemotingError::Transport(format!("connection to {} closed", address)),
        );
    }
}

/// A two-way request awaiting its response.
///
/// Dropping the future abandons the request; a response arriving later is
/// discarded.
pub struct MessageFuture {
    id: i64,
    address: String,
    timeout: Duration,
    receiver: oneshot::Receiver<Completion>,
    channel: Weak<ChannelInner>,
}

impl MessageFuture {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for the response until the request timeout elapses.
    pub async fn wait(mut self) -> Result<InvokeResult, RemotingError> {
        match tokio::time::timeout(self.timeout, &mut self.receiver).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(RemotingError::Closed),
            Err(_) => {
                tracing::debug!("Request id={} to {} timed out", self.id, self.address);
                Err(RemotingError::Timeout {
                    id: self.id,
                    address: self.address.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for MessageFuture {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.pending.remove(&self.id);
        }
    }
}
