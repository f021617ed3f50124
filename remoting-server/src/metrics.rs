//! Prometheus instrumentation of the provider side.
//!
//! Every [`Metrics`] value owns its own registry, so several servers in one
//! process (as in tests) never collide. [`serve_metrics`] exposes the text
//! format on `/metrics` plus a liveness check on `/health`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Seconds; calls are expected to sit well under the 3 s default timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0,
];

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Registers `metric` and hands back a handle to it.
fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    register(registry, Counter::with_opts(Opts::new(name, help))?)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    register(registry, Gauge::with_opts(Opts::new(name, help))?)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<CounterVec, prometheus::Error> {
    register(registry, CounterVec::new(Opts::new(name, help), &[label])?)
}

/// Handles to every provider-side metric.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Labelled by service name.
    pub requests_total: CounterVec,
    /// Labelled by error kind, e.g. `METHOD_NOT_FOUND`.
    pub errors_total: CounterVec,
    /// Labelled by service name.
    pub request_duration: HistogramVec,
    pub requests_inflight: Gauge,
    /// Requests answered with `server busy`.
    pub busy_rejections_total: Counter,
    pub heartbeats_total: Counter,
    pub services_exported: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let r = Registry::new();
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "remoting_request_duration_seconds",
                "Time spent dispatching a request",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["service"],
        )?;

        Ok(Self {
            connections_total: counter(&r, "remoting_connections_total", "Sessions accepted")?,
            connections_active: gauge(&r, "remoting_connections_active", "Sessions open")?,
            requests_total: counter_vec(
                &r,
                "remoting_requests_total",
                "Requests received per service",
                "service",
            )?,
            errors_total: counter_vec(
                &r,
                "remoting_errors_total",
                "Failed requests per error kind",
                "kind",
            )?,
            request_duration: register(&r, request_duration)?,
            requests_inflight: gauge(
                &r,
                "remoting_requests_inflight",
                "Requests holding a dispatch slot",
            )?,
            busy_rejections_total: counter(
                &r,
                "remoting_busy_rejections_total",
                "Requests refused with server busy",
            )?,
            heartbeats_total: counter(&r, "remoting_heartbeats_total", "Pings answered")?,
            services_exported: gauge(&r, "remoting_services_exported", "Services bound")?,
            registry: r,
        })
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut out = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut out)?;
        Ok(out)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Binds `addr` and serves until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serves the exposition endpoint on an already bound listener.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Metrics available at http://{}/metrics", addr);
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        match accepted {
            Ok((socket, _)) => {
                tokio::spawn(serve_scrape(TokioIo::new(socket), metrics.clone()));
            }
            Err(e) => tracing::error!("Metrics listener failed to accept: {}", e),
        }
    }
    tracing::info!("Metrics endpoint stopped");
}

async fn serve_scrape(io: TokioIo<tokio::net::TcpStream>, metrics: Arc<Metrics>) {
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let response = route(req.uri().path(), &metrics);
        async move { Ok::<_, Infallible>(response) }
    });
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!("Metrics scrape failed: {}", e);
    }
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => reply(StatusCode::OK, TEXT_FORMAT, body),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                reply(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
            }
        },
        "/health" | "/healthz" => reply(StatusCode::OK, "text/plain", "OK"),
        _ => reply(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

fn reply(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_encode_all_families() {
        let m = Metrics::new().unwrap();

        m.connections_total.inc();
        m.connections_active.inc();
        m.requests_total.with_label_values(&["Calc:1.0"]).inc();
        m.errors_total.with_label_values(&["TIMEOUT"]).inc();
        m.request_duration
            .with_label_values(&["Calc:1.0"])
            .observe(0.001);
        m.services_exported.set(2.0);

        let encoded = String::from_utf8(m.encode().unwrap()).unwrap();
        assert!(encoded.contains("remoting_connections_total 1"));
        assert!(encoded.contains("remoting_connections_active 1"));
        assert!(encoded.contains("remoting_requests_total{service=\"Calc:1.0\"} 1"));
        assert!(encoded.contains("remoting_errors_total{kind=\"TIMEOUT\"} 1"));
        assert!(encoded.contains("remoting_request_duration_seconds"));
        assert!(encoded.contains("remoting_services_exported 2"));
    }

    #[test]
    fn test_routes() {
        let m = Metrics::new().unwrap();
        assert_eq!(route("/metrics", &m).status(), StatusCode::OK);
        assert_eq!(route("/healthz", &m).status(), StatusCode::OK);
        assert_eq!(route("/", &m).status(), StatusCode::NOT_FOUND);
        assert_eq!(route("/metrics", &m).headers()[CONTENT_TYPE], TEXT_FORMAT);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.heartbeats_total.inc();
        let encoded = String::from_utf8(b.encode().unwrap()).unwrap();
        assert!(encoded.contains("remoting_heartbeats_total 0"));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.busy_rejections_total.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let body = get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("remoting_busy_rejections_total 1"));

        assert!(get(addr, "/health").await.ends_with("OK"));
        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
