//! TierCache Daemon
//!
//! Runs a cache service with its background engines, exposing health and
//! Prometheus endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TierCache                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workload   │───▶│ CacheService │───▶│   Metrics    │       │
//! │  │  (optional)  │    │  + engines   │    │   /metrics   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{CacheService, GetOptions, SetOptions};
use tiercache::config::CacheConfiguration;
use tiercache::observability::{CacheObserver, FanoutObserver, PrometheusObserver, TracingObserver};
use tiercache::persistence::{FilePersistence, InMemoryPersistence, PersistenceStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TierCache - Multi-tier intelligent cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (built-in three-layer defaults when absent)
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for persisted configuration and history
    #[arg(long, env = "TIERCACHE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Generate a synthetic read/write workload
    #[arg(long, env = "TIERCACHE_DEMO_WORKLOAD")]
    demo_workload: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting TierCache");

    let config = match &args.config {
        Some(path) => {
            let yaml = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading configuration {}", path.display()))?;
            CacheConfiguration::from_yaml(&yaml)?
        }
        None => CacheConfiguration::default(),
    };
    info!("  Layers: {}", config.layers.len());
    info!("  Prefetching: {}", config.global.intelligent_prefetching);
    info!("  Optimization: {}", config.global.ai_optimization);

    let persistence: Arc<dyn PersistenceStore> = match &args.state_dir {
        Some(dir) => {
            info!("  State directory: {}", dir.display());
            Arc::new(FilePersistence::new(dir))
        }
        None => Arc::new(InMemoryPersistence::new()),
    };

    let prometheus_observer = PrometheusObserver::register(prometheus::default_registry())
        .context("registering cache event counters")?;
    let observer: Arc<dyn CacheObserver> = Arc::new(
        FanoutObserver::new()
            .with_observer(Arc::new(TracingObserver::new()))
            .with_observer(Arc::new(prometheus_observer)),
    );

    let service = CacheService::builder(config)
        .observer(observer)
        .persistence(persistence)
        .build()?;
    service.restore().await;
    service.start();

    let shutdown = CancellationToken::new();

    if args.demo_workload {
        let workload_service = service.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            run_workload(workload_service, token).await;
        });
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_service = service.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_service).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_service = service.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_service).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    service.stop().await;

    info!("TierCache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Demo Workload
// =============================================================================

const WORKLOAD_PAGES: [&str; 6] = ["home", "feed", "profile", "search", "cart", "checkout"];
const WORKLOAD_REGIONS: [&str; 3] = ["eu", "us", "ap"];

/// Users wander through a small page graph, reading through the cache.
async fn run_workload(service: Arc<CacheService>, shutdown: CancellationToken) {
    info!("Synthetic workload started");
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (actor, page, region, tag) = {
            let mut rng = rand::thread_rng();
            let actor = format!("user-{}", rng.gen_range(0..20));
            let page = WORKLOAD_PAGES[rng.gen_range(0..WORKLOAD_PAGES.len())];
            let region = WORKLOAD_REGIONS[rng.gen_range(0..WORKLOAD_REGIONS.len())];
            let tag = if rng.gen_bool(0.5) { "pages" } else { "fragments" };
            (actor, page, region, tag)
        };

        let options = GetOptions::new().actor(&actor).region(region);
        match service.get_with(page, &options) {
            Ok(Some(_)) => {}
            Ok(None) => {
                let body = format!("<html>{}</html>", page).repeat(32);
                let write = SetOptions::new()
                    .content_type("text/html")
                    .tag(tag)
                    .ttl(Duration::from_secs(30));
                if let Err(e) = service.set(page, body, write) {
                    error!(key = page, error = %e, "Workload write failed");
                }
            }
            Err(e) => error!(key = page, error = %e, "Workload read failed"),
        }
    }
    info!("Synthetic workload stopped");
}

// =============================================================================
// HTTP Helpers
// =============================================================================

mod http {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    pub fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    pub fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
        respond(status, "text/plain", body)
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, service: Arc<CacheService>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        service: Arc<CacheService>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => http::text(StatusCode::OK, "ok"),
            "/readyz" => {
                let metrics = service.get_global_metrics();
                if !service.is_stopped() && metrics.active_layers > 0 {
                    http::text(StatusCode::OK, "ok")
                } else {
                    http::text(StatusCode::SERVICE_UNAVAILABLE, "no active layers")
                }
            }
            _ => http::text(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept error")?;
        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::spawn(async move {
            let handler = service_fn(move |req| health_handler(req, service.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

struct LayerGauges {
    utilization: prometheus::GaugeVec,
    entries: prometheus::IntGaugeVec,
    hit_rate: prometheus::GaugeVec,
}

impl LayerGauges {
    fn register() -> anyhow::Result<Self> {
        Ok(Self {
            utilization: prometheus::register_gauge_vec!(
                "tiercache_layer_utilization",
                "Fraction of layer byte capacity in use",
                &["layer"]
            )?,
            entries: prometheus::register_int_gauge_vec!(
                "tiercache_layer_entries",
                "Entries resident on the layer",
                &["layer"]
            )?,
            hit_rate: prometheus::register_gauge_vec!(
                "tiercache_layer_hit_rate",
                "Smoothed hit rate of the layer",
                &["layer"]
            )?,
        })
    }

    fn refresh(&self, service: &CacheService) {
        for layer in service.layers() {
            let id = layer.id.as_str();
            self.utilization.with_label_values(&[id]).set(layer.utilization);
            self.entries
                .with_label_values(&[id])
                .set(layer.usage.entries as i64);
            self.hit_rate
                .with_label_values(&[id])
                .set(layer.performance.hit_rate);
        }
    }
}

async fn run_metrics_server(addr: &str, service: Arc<CacheService>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let gauges = Arc::new(LayerGauges::register()?);

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        service: Arc<CacheService>,
        gauges: Arc<LayerGauges>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                gauges.refresh(&service);
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                match encoder.encode(&metric_families, &mut buffer) {
                    Ok(()) => http::respond(StatusCode::OK, prometheus::TEXT_FORMAT, buffer),
                    Err(e) => {
                        tracing::error!("Metrics encoding failed: {}", e);
                        http::text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                    }
                }
            }
            "/analytics" => match serde_json::to_vec(&service.get_global_metrics()) {
                Ok(body) => http::respond(StatusCode::OK, "application/json", body),
                Err(_) => http::text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"),
            },
            _ => http::text(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept error")?;
        let io = TokioIo::new(stream);
        let service = service.clone();
        let gauges = gauges.clone();

        tokio::spawn(async move {
            let handler = service_fn(move |req| metrics_handler(req, service.clone(), gauges.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
