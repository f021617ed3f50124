//! Loopback peer used by the client tests.

use parking_lot::Mutex;
use remoting_core::{HeartbeatMessage, Invoke, InvokeResult, Message, ValueType};
use remoting_protocol::{Codec, FrameDecoder};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the fake peer answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    /// `add` sums its arguments, `fail` answers with an error,
    /// `delay(ms, value)` answers `value` after `ms` milliseconds.
    Sum,
    /// Requests are read and never answered. Pings are still answered.
    Never,
}

pub(crate) struct FakeServer {
    address: String,
    pings: Arc<AtomicUsize>,
    invokes: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl FakeServer {
    pub(crate) async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let pings = Arc::new(AtomicUsize::new(0));
        let invokes = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_task = {
            let pings = pings.clone();
            let invokes = invokes.clone();
            let accepted = accepted.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let handler = tokio::spawn(serve(
                        stream,
                        reply,
                        pings.clone(),
                        invokes.clone(),
                        tasks.clone(),
                    ));
                    tasks.lock().push(handler);
                }
            })
        };

        Self {
            address,
            pings,
            invokes,
            accepted,
            tasks,
            accept_task,
        }
    }

    pub(crate) fn address(&self) -> String {
        self.address.clone()
    }

    pub(crate) fn pings_received(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn invokes_received(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }

    pub(crate) fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drops every accepted socket; the listener keeps accepting.
    pub(crate) async fn drop_connections(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tokio::task::yield_now().await;
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn serve(
    stream: TcpStream,
    reply: Reply,
    pings: Arc<AtomicUsize>,
    invokes: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let codec = Codec::default();
    let mut decoder = FrameDecoder::new(codec.clone());
    let mut buf = vec![0u8; 4096];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);
        while let Ok(Some(msg)) = decoder.next_message() {
            match msg {
                Message::Heartbeat(hb) if hb.is_ping() => {
                    pings.fetch_add(1, Ordering::SeqCst);
                    write(&codec, &writer, HeartbeatMessage::pong(hb.id).into()).await;
                }
                Message::Invoke(invoke) => {
                    invokes.fetch_add(1, Ordering::SeqCst);
                    if reply == Reply::Never || !invoke.two_way {
                        continue;
                    }
                    let (delay, result) = answer(&invoke);
                    let codec = codec.clone();
                    let writer = writer.clone();
                    let task = tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        write(&codec, &writer, result.into()).await;
                    });
                    tasks.lock().push(task);
                }
                _ => {}
            }
        }
    }
}

fn answer(invoke: &Invoke) -> (Duration, InvokeResult) {
    let args = invoke.args();
    let result = match invoke.method_name() {
        "fail" => InvokeResult::error(invoke.id, "boom"),
        "delay" => {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            let value = args.get(1).cloned();
            return (
                Duration::from_millis(ms),
                InvokeResult::ok(invoke.id, value).with_serializer(invoke.serializer_id),
            );
        }
        _ => {
            let total: i64 = args.iter().filter_map(Value::as_i64).sum();
            InvokeResult::ok(invoke.id, Some(json!(total)))
        }
    };
    (Duration::ZERO, result.with_serializer(invoke.serializer_id))
}

async fn write(codec: &Codec, writer: &tokio::sync::Mutex<OwnedWriteHalf>, msg: Message) {
    let frame = codec.encode_to_buffer(&msg).unwrap();
    let _ = writer.lock().await.write_all(frame.readable()).await;
}

/// `Calc:1.0#add(int, int)` aimed at `address`.
pub(crate) fn add_invoke(address: &str, a: i64, b: i64) -> Invoke {
    Invoke::new(
        "Calc",
        "1.0",
        "add",
        vec![json!(a), json!(b)],
        vec![ValueType::Int, ValueType::Int],
    )
    .with_remote_address(address)
}

/// `Calc:1.0#delay(long, int)`; the peer answers `value` after `ms`.
pub(crate) fn delay_invoke(address: &str, ms: u64, value: i64) -> Invoke {
    Invoke::new(
        "Calc",
        "1.0",
        "delay",
        vec![json!(ms), json!(value)],
        vec![ValueType::Long, ValueType::Int],
    )
    .with_remote_address(address)
}
