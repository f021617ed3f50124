//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use remoting_client::RpcClient;
use remoting_core::{Invoke, ValueType};
use remoting_server::{Server, ServerConfig, ServiceProvider};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    address: String,
    client: Arc<RpcClient>,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let server = Arc::new(Server::new(ServerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
    )));

    let provider = ServiceProvider::new("Echo", "1.0")
        .sync_method("echo", vec![ValueType::String], |args| {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .sync_method("add", vec![ValueType::Int, ValueType::Int], |args| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });

    let (listener, address) = rt.block_on(async {
        let listener = server.bind().await.unwrap();
        server.export(provider).await.unwrap();
        (listener, format!("127.0.0.1:{}", server.port()))
    });

    let server_clone = server.clone();
    let server_handle = rt.spawn(async move {
        let _ = server_clone.serve(listener).await;
    });

    TestSetup {
        _server_handle: server_handle,
        address,
        client: Arc::new(RpcClient::new(Default::default())),
    }
}

fn bench_add_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_add");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add", |b| {
        b.to_async(&rt).iter(|| async {
            let invoke = Invoke::new(
                "Echo",
                "1.0",
                "add",
                vec![json!(1), json!(2)],
                vec![ValueType::Int, ValueType::Int],
            )
            .with_remote_address(setup.address.clone());
            black_box(setup.client.invoke(invoke).await.unwrap())
        });
    });

    group.finish();
}

fn bench_echo_payload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_echo");

    for size in [100, 1000, 10000] {
        let payload = "x".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let invoke = Invoke::new(
                    "Echo",
                    "1.0",
                    "echo",
                    vec![json!(payload)],
                    vec![ValueType::String],
                )
                .with_remote_address(setup.address.clone());
                black_box(setup.client.invoke(invoke).await.unwrap())
            });
        });
    }

    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");

    for concurrency in [1, 8, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async {
                    let calls = (0..concurrency).map(|i| {
                        let invoke = Invoke::new(
                            "Echo",
                            "1.0",
                            "add",
                            vec![json!(i), json!(1)],
                            vec![ValueType::Int, ValueType::Int],
                        )
                        .with_remote_address(setup.address.clone());
                        setup.client.invoke(invoke)
                    });
                    black_box(futures::future::join_all(calls).await)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_latency,
    bench_echo_payload,
    bench_concurrent_calls,
);

criterion_main!(benches);
