use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "pitwall";

/// Prometheus metrics for monitor health.
///
/// All metrics use the "pitwall" namespace and, where per-category, carry a
/// `category` label.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed poll cycles by category and outcome.
    pub poll_cycles: CounterVec,
    /// Upstream requests by category and status.
    pub fetch_requests: CounterVec,
    /// Upstream request duration by category (10ms-10s buckets).
    pub fetch_duration: HistogramVec,
    /// Records dropped while decoding, by category.
    pub records_dropped: CounterVec,
    /// Records skipped for referencing an unknown entity, by category.
    pub unknown_entity_refs: CounterVec,
    /// Snapshots the reconciler refused to commit, by category.
    pub snapshots_rejected: CounterVec,
    /// Category watermark as unix seconds.
    pub watermark: GaugeVec,
    /// Whether a category is flagged persistently incomplete (1=yes, 0=no).
    pub category_stale: GaugeVec,
    /// Entities in the registry.
    pub entities_tracked: Gauge,
    /// Registry views published to readers.
    pub view_publishes: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let poll_cycles = CounterVec::new(
            Opts::new("poll_cycles_total", "Completed poll cycles by outcome.")
                .namespace(NAMESPACE),
            &["category", "outcome"],
        )?;
        let fetch_requests = CounterVec::new(
            Opts::new("fetch_requests_total", "Upstream requests by status.").namespace(NAMESPACE),
            &["category", "status"],
        )?;
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "fetch_duration_seconds",
                "Upstream request duration by category.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["category"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Records dropped because they could not be decoded.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let unknown_entity_refs = CounterVec::new(
            Opts::new(
                "unknown_entity_refs_total",
                "Records skipped for referencing an unknown entity.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let snapshots_rejected = CounterVec::new(
            Opts::new(
                "snapshots_rejected_total",
                "Snapshots rejected by the reconciler.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let watermark = GaugeVec::new(
            Opts::new(
                "watermark_timestamp_seconds",
                "Timestamp up to which a category has been reconciled.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let category_stale = GaugeVec::new(
            Opts::new(
                "category_stale",
                "Whether a category is persistently incomplete (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let entities_tracked = Gauge::with_opts(
            Opts::new("entities_tracked", "Number of entities in the registry.")
                .namespace(NAMESPACE),
        )?;
        let view_publishes = Counter::with_opts(
            Opts::new(
                "view_publishes_total",
                "Registry views published to readers.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(poll_cycles.clone()))?;
        registry.register(Box::new(fetch_requests.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(unknown_entity_refs.clone()))?;
        registry.register(Box::new(snapshots_rejected.clone()))?;
        registry.register(Box::new(watermark.clone()))?;
        registry.register(Box::new(category_stale.clone()))?;
        registry.register(Box::new(entities_tracked.clone()))?;
        registry.register(Box::new(view_publishes.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            poll_cycles,
            fetch_requests,
            fetch_duration,
            records_dropped,
            unknown_entity_refs,
            snapshots_rejected,
            watermark,
            category_stale,
            entities_tracked,
            view_publishes,
        })
    }

    /// Encode all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
