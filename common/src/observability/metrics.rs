//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per engine instance. The host decides
//! whether to expose it over HTTP.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus registry + handles for the streaming engine.
///
/// Cloning is cheap; every handle shares the same underlying registry, so
/// the recorder thread can observe encode latency on its own clone.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Ingest counters
    pub messages_received_total: IntCounter,
    pub binary_frames_received_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub malformed_frames_total: IntCounter,
    pub control_messages_ignored_total: IntCounter,
    pub connection_attempts_total: IntCounter,

    // Recording counters
    pub recording_chunks_dropped_total: IntCounter,

    // Buffer gauges
    pub jitter_buffer_occupancy_packets: IntGauge,

    // Latency histograms (seconds)
    pub ingest_pipeline_seconds: Histogram,
    pub encode_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the engine metrics.
    ///
    /// Every family is prefixed `audiopirate_` and carries a constant
    /// `process=<process_name>` label.
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("audiopirate".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;
        let counter = |name: &str, help: &str| register_counter(&registry, name, help);

        Ok(Self {
            messages_received_total: counter(
                "messages_received_total",
                "Total WebSocket frames received (text and binary)",
            )?,
            binary_frames_received_total: counter(
                "binary_frames_received_total",
                "Total binary PCM frames received",
            )?,
            bytes_received_total: counter(
                "bytes_received_total",
                "Total PCM payload bytes received",
            )?,
            malformed_frames_total: counter(
                "malformed_frames_total",
                "Binary frames rejected for bad length",
            )?,
            control_messages_ignored_total: counter(
                "control_messages_ignored_total",
                "Control messages that were malformed or of an unknown type",
            )?,
            connection_attempts_total: counter(
                "connection_attempts_total",
                "Connect requests that started a new attempt",
            )?,
            recording_chunks_dropped_total: counter(
                "recording_chunks_dropped_total",
                "PCM chunks not handed to the recorder because its queue was full",
            )?,
            jitter_buffer_occupancy_packets: register(
                &registry,
                IntGauge::new(
                    "jitter_buffer_occupancy_packets",
                    "Packets currently held by the jitter buffer",
                )?,
            )?,
            ingest_pipeline_seconds: register_histogram(
                &registry,
                "ingest_pipeline_seconds",
                "Time from binary frame arrival to sink/recorder hand-off (seconds)",
            )?,
            encode_seconds: register_histogram(
                &registry,
                "encode_seconds",
                "Time spent encoding and muxing one PCM chunk (seconds)",
            )?,
            registry,
        })
    }

    /// Snapshot of every registered family, as a scrape would see it.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Serves the registry in text format on `GET /metrics` until the
    /// listener fails.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                let svc = service_fn(move |req| {
                    let response = scrape_response(&req, &registry);
                    async move { Ok::<_, Infallible>(response) }
                });
                async move { Ok::<_, Infallible>(svc) }
            });

            let server = Server::try_bind(&cfg.bind)?.serve(make_svc);
            info!("Metrics endpoint on http://{}/metrics", cfg.bind);
            server.await.map_err(|e| {
                warn!("Metrics server stopped: {}", e);
                anyhow::Error::new(e)
            })
        })
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    register(registry, IntCounter::new(name, help)?)
}

fn register_histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    register(registry, Histogram::with_opts(HistogramOpts::new(name, help))?)
}

fn scrape_response(req: &Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return plain(StatusCode::NOT_FOUND, "not found".into());
    }

    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&registry.gather(), &mut body) {
        Ok(()) => Response::builder()
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(body))
            .unwrap_or_else(|e| plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")),
    }
}

fn plain(status: StatusCode, text: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp
}
