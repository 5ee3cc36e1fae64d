//! Proxy metrics collection and export.
//!
//! Aggregate counters only; no per-user data is retained. The exporter
//! serves Prometheus text format on a separate port so probes never touch
//! the SOCKS5 listener.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::Result;

/// Upper bounds (seconds) for the request-duration histogram buckets.
const DURATION_BUCKETS: [f64; 8] = [0.005, 0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0];

/// Atomic metrics collector shared by the accept loop and all sessions.
pub struct Metrics {
    start_time: Instant,
    connections_total: AtomicU64,
    active_connections: AtomicU64,
    rate_limit_hits: AtomicU64,
    auth_failures: AtomicU64,
    blocked_destinations: AtomicU64,
    bytes_client_to_upstream: AtomicU64,
    bytes_upstream_to_client: AtomicU64,
    duration_buckets: [AtomicU64; DURATION_BUCKETS.len()],
    duration_sum_micros: AtomicU64,
    duration_count: AtomicU64,
}

impl Metrics {
    /// Create a new collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            blocked_destinations: AtomicU64::new(0),
            bytes_client_to_upstream: AtomicU64::new(0),
            bytes_upstream_to_client: AtomicU64::new(0),
            duration_buckets: Default::default(),
            duration_sum_micros: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
        }
    }

    /// Record an accepted connection.
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished connection.
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a rate-limit rejection.
    pub fn rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed authentication attempt.
    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a destination denied by the allow-list.
    pub fn destination_blocked(&self) {
        self.blocked_destinations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record relayed byte totals for one session.
    pub fn add_relayed_bytes(&self, client_to_upstream: u64, upstream_to_client: u64) {
        self.bytes_client_to_upstream
            .fetch_add(client_to_upstream, Ordering::Relaxed);
        self.bytes_upstream_to_client
            .fetch_add(upstream_to_client, Ordering::Relaxed);
    }

    /// Observe one request duration into the histogram.
    pub fn observe_request_duration(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        for (i, &bound) in DURATION_BUCKETS.iter().enumerate() {
            if secs <= bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total accepted connections.
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Currently active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Total rate-limit rejections.
    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    /// Uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);

        counter(
            &mut out,
            "socks5_connections_total",
            "Total connections",
            self.connections_total(),
        );
        counter(
            &mut out,
            "socks5_rate_limit_hits_total",
            "Rate limit violations",
            self.rate_limit_hits(),
        );
        counter(
            &mut out,
            "socks5_auth_failures_total",
            "Failed authentication attempts",
            self.auth_failures.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "socks5_blocked_destinations_total",
            "CONNECT requests denied by the allow-list",
            self.blocked_destinations.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "socks5_bytes_client_to_upstream_total",
            "Bytes relayed from clients to upstreams",
            self.bytes_client_to_upstream.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "socks5_bytes_upstream_to_client_total",
            "Bytes relayed from upstreams to clients",
            self.bytes_upstream_to_client.load(Ordering::Relaxed),
        );

        out.push_str("# HELP socks5_active_connections Active connections\n");
        out.push_str("# TYPE socks5_active_connections gauge\n");
        out.push_str(&format!(
            "socks5_active_connections {}\n",
            self.active_connections()
        ));

        out.push_str("# HELP socks5_request_duration_seconds Request duration\n");
        out.push_str("# TYPE socks5_request_duration_seconds histogram\n");
        for (i, &bound) in DURATION_BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "socks5_request_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bound,
                self.duration_buckets[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.duration_count.load(Ordering::Relaxed);
        out.push_str(&format!(
            "socks5_request_duration_seconds_bucket{{le=\"+Inf\"}} {count}\n"
        ));
        out.push_str(&format!(
            "socks5_request_duration_seconds_sum {}\n",
            self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!("socks5_request_duration_seconds_count {count}\n"));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

/// Serve `GET /metrics` and `GET /health` on the given listener.
pub async fn serve_exporter(metrics: Arc<Metrics>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(Arc::clone(&metrics), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!("Metrics connection error: {}", e);
            }
        });
    }
}

async fn handle(
    metrics: Arc<Metrics>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(metrics.render_prometheus())))
            .unwrap(),
        "/health" => Response::builder()
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"ok"}"#)))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}
