//! Connection management.

use parking_lot::Mutex;
use remoting_core::{next_message_id, HeartbeatMessage, Message, RemotingError};
use remoting_protocol::{Codec, FrameDecoder, ProtocolError, DEFAULT_PORT};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Client channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read+write idleness after which a PING is sent.
    pub heartbeat_interval: Duration,
    /// Timeout applied to calls made through a consumer stub.
    pub default_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Serializer used by consumer stubs.
    pub serializer_id: u8,
    /// Host advertised in consumer participant records.
    pub local_host: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            default_timeout: Duration::from_millis(remoting_core::DEFAULT_TIMEOUT_MS),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            serializer_id: remoting_core::DEFAULT_SERIALIZER_ID,
            local_host: "127.0.0.1".to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_serializer(mut self, serializer_id: u8) -> Self {
        self.serializer_id = serializer_id;
        self
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receiver of what a connection reads.
pub trait ConnectionEvents: Send + Sync {
    /// A response or request arrived. Heartbeats are handled by the connection.
    fn on_message(&self, connection: &Arc<Connection>, msg: Message);

    /// A frame could not be decoded.
    fn on_decode_error(&self, connection: &Arc<Connection>, err: ProtocolError);

    /// The connection became inactive, whether the peer hung up or it was
    /// closed locally. Called once per connection.
    fn on_closed(&self, connection: &Connection);
}

/// Appends the default port when `address` has none.
pub fn normalize_address(address: &str) -> String {
    if address.rsplit_once(':').is_some() {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_PORT)
    }
}

/// One TCP connection to a peer.
pub struct Connection {
    id: u64,
    address: String,
    codec: Codec,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    active: AtomicBool,
    last_activity: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: Weak<dyn ConnectionEvents>,
}

impl Connection {
    /// Connects to `address` and starts the read loop and idle heartbeat.
    pub async fn connect(
        address: &str,
        config: &ChannelConfig,
        codec: Codec,
        events: Weak<dyn ConnectionEvents>,
    ) -> Result<Arc<Connection>, RemotingError> {
        tracing::debug!("Connecting to {}...", address);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RemotingError::ConnectFailed {
                address: address.to_string(),
                reason: format!("timed out after {:?}", config.connect_timeout),
            })?
            .map_err(|e| RemotingError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
            codec,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            active: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            events,
        });

        let reader = tokio::spawn(read_loop(conn.clone(), read_half, config.read_buffer_size));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(&conn),
            config.heartbeat_interval,
        ));
        conn.tasks.lock().extend([reader, heartbeat]);

        tracing::debug!("Connected to {}", address);
        Ok(conn)
    }

    /// Process-unique id; a reconnect to the same address gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Time since the last read or write.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Frames and writes one message. Writes are serialized per connection.
    pub async fn send(&self, msg: &Message) -> Result<(), RemotingError> {
        if !self.is_active() {
            return Err(RemotingError::Transport(format!(
                "connection to {} is closed",
                self.address
            )));
        }
        let frame = self.codec.encode_to_buffer(msg)?;

        let written = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(frame.readable()).await,
                None => Err(std::io::ErrorKind::NotConnected.into()),
            }
        };
        if let Err(e) = written {
            tracing::debug!("Write to {} failed: {}", self.address, e);
            self.close().await;
            return Err(RemotingError::Transport(format!(
                "write to {} failed: {}",
                self.address, e
            )));
        }
        self.touch();
        tracing::debug!(
            "Sent message id={} to {} ({} bytes)",
            msg.id(),
            self.address,
            frame.readable_bytes()
        );
        Ok(())
    }

    /// Closes the connection and stops its tasks. Idempotent.
    pub async fn close(&self) {
        if self.teardown().await {
            tracing::debug!("Closed connection to {}", self.address);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Marks the connection inactive, notifies the events receiver and
    /// shuts the writer down. Only the first call does anything.
    async fn teardown(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(events) = self.events.upgrade() {
            events.on_closed(self);
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        true
    }
}

async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf, buffer_size: usize) {
    let mut decoder = FrameDecoder::new(conn.codec.clone());
    let mut buf = vec![0u8; buffer_size];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("read_loop: {} closed the connection", conn.address);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("read_loop: read from {} failed: {}", conn.address, e);
                break;
            }
        };
        conn.touch();
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_message() {
                Ok(Some(Message::Heartbeat(hb))) if hb.is_ping() => {
                    let pong = Message::from(HeartbeatMessage::pong(hb.id));
                    if conn.send(&pong).await.is_err() {
                        break 'read;
                    }
                }
                Ok(Some(Message::Heartbeat(hb))) => {
                    tracing::debug!("read_loop: heartbeat ack id={} from {}", hb.id, conn.address);
                }
                Ok(Some(mut msg)) => {
                    msg.set_remote_address(conn.address.clone());
                    match conn.events.upgrade() {
                        Some(events) => events.on_message(&conn, msg),
                        None => break 'read,
                    }
                }
                Ok(None) => break,
                Err(err @ ProtocolError::InvalidBodyLength { .. }) => {
                    tracing::warn!("read_loop: unrecoverable frame from {}: {}", conn.address, err);
                    break 'read;
                }
                Err(err) => {
                    tracing::warn!("read_loop: dropping frame from {}: {}", conn.address, err);
                    if let Some(events) = conn.events.upgrade() {
                        events.on_decode_error(&conn, err);
                    }
                }
            }
        }
    }

    conn.teardown().await;
}

async fn heartbeat_loop(conn: Weak<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(conn) = conn.upgrade() else {
            break;
        };
        if !conn.is_active() {
            break;
        }
        if conn.idle_for() >= interval {
            let ping = Message::from(HeartbeatMessage::ping(next_message_id()));
            tracing::debug!("Connection to {} idle, sending heartbeat", conn.address);
            if conn.send(&ping).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, Reply};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        closed: AtomicU64,
    }

    impl ConnectionEvents for Recorder {
        fn on_message(&self, _connection: &Arc<Connection>, msg: Message) {
            self.messages.lock().push(msg);
        }

        fn on_decode_error(&self, _connection: &Arc<Connection>, _err: ProtocolError) {}

        fn on_closed(&self, _connection: &Connection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn connect(server: &FakeServer, config: &ChannelConfig, recorder: &Arc<Recorder>) -> Arc<Connection> {
        let events: Weak<dyn ConnectionEvents> = Arc::downgrade(recorder) as Weak<dyn ConnectionEvents>;
        Connection::connect(&server.address(), config, Codec::default(), events)
            .await
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.default_timeout, Duration::from_secs(3));
        assert_eq!(config.serializer_id, 1);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ChannelConfig::new().with_read_buffer_size(100); // Below minimum
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ChannelConfig::new().with_read_buffer_size(10 * 1024 * 1024); // Above maximum
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("10.0.0.1:9000"), "10.0.0.1:9000");
        assert_eq!(normalize_address("10.0.0.1"), "10.0.0.1:8700");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let recorder = Arc::new(Recorder::default());
        let events: Weak<dyn ConnectionEvents> = Arc::downgrade(&recorder) as Weak<dyn ConnectionEvents>;
        let err = Connection::connect(&address, &ChannelConfig::default(), Codec::default(), events)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RemotingError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_responses_reach_events() {
        let server = FakeServer::start(Reply::Sum).await;
        let recorder = Arc::new(Recorder::default());
        let conn = connect(&server, &ChannelConfig::default(), &recorder).await;

        let invoke = crate::testing::add_invoke(&server.address(), 2, 3).with_id(77);
        conn.send(&invoke.into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.messages.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let messages = recorder.messages.lock();
        match &messages[0] {
            Message::Result(result) => {
                assert_eq!(result.id, 77);
                assert_eq!(result.value(), Some(&serde_json::json!(5)));
                assert_eq!(result.remote_address.as_deref(), Some(server.address().as_str()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_connection_sends_ping() {
        let server = FakeServer::start(Reply::Never).await;
        let recorder = Arc::new(Recorder::default());
        let config = ChannelConfig::new().with_heartbeat_interval(Duration::from_millis(30));
        let conn = connect(&server, &config, &recorder).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.pings_received() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_peer_close_marks_inactive() {
        let server = FakeServer::start(Reply::Never).await;
        let recorder = Arc::new(Recorder::default());
        let conn = connect(&server, &ChannelConfig::default(), &recorder).await;

        server.drop_connections().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.closed.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!conn.is_active());
        assert!(conn.send(&HeartbeatMessage::ping(1).into()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_close_notifies_once() {
        let server = FakeServer::start(Reply::Never).await;
        let recorder = Arc::new(Recorder::default());
        let conn = connect(&server, &ChannelConfig::default(), &recorder).await;
        let other = connect(&server, &ChannelConfig::default(), &recorder).await;
        assert_ne!(conn.id(), other.id());

        conn.close().await;
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert!(!conn.is_active());

        conn.close().await;
        server.drop_connections().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while other.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // The closed connection does not report the hang-up a second time.
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 2);
    }
}
