use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "impressoor" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events accepted into a batch, by category.
    pub events_ingested: CounterVec,
    /// Total events dropped, by reason (validation/corrupt/consent).
    pub events_dropped: CounterVec,
    /// Total batch flushes handed to delivery.
    pub batches_flushed: Counter,
    /// Total delivery errors.
    pub delivery_errors: Counter,
    /// Total persisted records re-admitted by recovery passes.
    pub records_recovered: Counter,
    /// Registration hits resolved (registered or already present).
    pub hits_processed: Counter,
    /// Registration hits re-queued for a later attempt.
    pub hits_retried: Counter,
    /// Registration hits dropped on terminal failure.
    pub hits_dropped: Counter,
    /// Events currently buffered, by category.
    pub pending_events: GaugeVec,
    /// Whether the consent gate currently allows collection (1=yes).
    pub consent_allowed: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_ingested = CounterVec::new(
            Opts::new(
                "events_ingested_total",
                "Total events accepted into a batch by category.",
            )
            .namespace("impressoor"),
            &["category"],
        )?;
        let events_dropped = CounterVec::new(
            Opts::new("events_dropped_total", "Total events dropped by reason.")
                .namespace("impressoor"),
            &["reason"],
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new(
                "batches_flushed_total",
                "Total batch flushes handed to delivery.",
            )
            .namespace("impressoor"),
        )?;
        let delivery_errors = Counter::with_opts(
            Opts::new("delivery_errors_total", "Total delivery errors.").namespace("impressoor"),
        )?;
        let records_recovered = Counter::with_opts(
            Opts::new(
                "records_recovered_total",
                "Total persisted records re-admitted by recovery passes.",
            )
            .namespace("impressoor"),
        )?;
        let hits_processed = Counter::with_opts(
            Opts::new(
                "hits_processed_total",
                "Total registration hits resolved successfully.",
            )
            .namespace("impressoor"),
        )?;
        let hits_retried = Counter::with_opts(
            Opts::new(
                "hits_retried_total",
                "Total registration hits re-queued for a later attempt.",
            )
            .namespace("impressoor"),
        )?;
        let hits_dropped = Counter::with_opts(
            Opts::new(
                "hits_dropped_total",
                "Total registration hits dropped on terminal failure.",
            )
            .namespace("impressoor"),
        )?;
        let pending_events = GaugeVec::new(
            Opts::new("pending_events", "Events currently buffered by category.")
                .namespace("impressoor"),
            &["category"],
        )?;
        let consent_allowed = Gauge::with_opts(
            Opts::new(
                "consent_allowed",
                "Whether the consent gate currently allows collection (1=yes, 0=no).",
            )
            .namespace("impressoor"),
        )?;

        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(delivery_errors.clone()))?;
        registry.register(Box::new(records_recovered.clone()))?;
        registry.register(Box::new(hits_processed.clone()))?;
        registry.register(Box::new(hits_retried.clone()))?;
        registry.register(Box::new(hits_dropped.clone()))?;
        registry.register(Box::new(pending_events.clone()))?;
        registry.register(Box::new(consent_allowed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_ingested,
            events_dropped,
            batches_flushed,
            delivery_errors,
            records_recovered,
            hits_processed,
            hits_retried,
            hits_dropped,
            pending_events,
            consent_allowed,
        })
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
