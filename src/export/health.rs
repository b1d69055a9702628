use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "netquality";

/// Prometheus metrics for the ingestion pipeline.
///
/// Covers both write paths: the in-memory cache (nodes, evictions, sweeps)
/// and the batch writer (acceptance, drops by reason, flush outcomes).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Writer ===
    /// Records accepted onto the writer queue.
    pub records_accepted: Counter,
    /// Records dropped, by reason (queue_full, closed, retry_exhausted).
    pub records_dropped: CounterVec,
    /// Records committed to the sink.
    pub records_committed: Counter,
    /// Batches committed, by trigger (size, timer, shutdown, drain).
    pub batches_flushed: CounterVec,
    /// Failed flush attempts by sink (each retry counts).
    pub flush_attempt_errors: CounterVec,
    /// Batches dropped after exhausting retries.
    pub batch_flush_failures: Counter,
    /// Duration of a full flush including retries, by sink.
    pub flush_duration: HistogramVec,
    /// Records per flushed batch.
    pub batch_size: Histogram,
    /// Records accepted but not yet handed to a flush.
    pub queue_depth: Gauge,

    // === Cache ===
    /// Nodes with a ring buffer.
    pub cache_nodes: Gauge,
    /// Samples overwritten by newer ones.
    pub cache_evictions: Counter,
    /// Completed aggregation sweeps.
    pub cache_sweeps: Counter,
    /// Aggregation sweep duration.
    pub sweep_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_accepted = Counter::with_opts(
            Opts::new(
                "records_accepted_total",
                "Total records accepted onto the writer queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_dropped = CounterVec::new(
            Opts::new("records_dropped_total", "Total records dropped by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let records_committed = Counter::with_opts(
            Opts::new(
                "records_committed_total",
                "Total records committed to the sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_flushed = CounterVec::new(
            Opts::new(
                "batches_flushed_total",
                "Total batches committed by flush trigger.",
            )
            .namespace(NAMESPACE),
            &["trigger"],
        )?;
        let flush_attempt_errors = CounterVec::new(
            Opts::new(
                "flush_attempt_errors_total",
                "Total failed flush attempts by sink.",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;
        let batch_flush_failures = Counter::with_opts(
            Opts::new(
                "batch_flush_failures_total",
                "Total batches dropped after exhausting retries.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Batch flush duration including retries.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["sink"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Records per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new(
                "queue_depth",
                "Records accepted but not yet handed to a flush.",
            )
            .namespace(NAMESPACE),
        )?;

        let cache_nodes = Gauge::with_opts(
            Opts::new("cache_nodes", "Number of nodes with a ring buffer.").namespace(NAMESPACE),
        )?;
        let cache_evictions = Counter::with_opts(
            Opts::new(
                "cache_evictions_total",
                "Total samples overwritten in node ring buffers.",
            )
            .namespace(NAMESPACE),
        )?;
        let cache_sweeps = Counter::with_opts(
            Opts::new("cache_sweeps_total", "Total aggregation sweeps.").namespace(NAMESPACE),
        )?;
        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new("sweep_duration_seconds", "Aggregation sweep duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0]),
        )?;

        registry.register(Box::new(records_accepted.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(records_committed.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(flush_attempt_errors.clone()))?;
        registry.register(Box::new(batch_flush_failures.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(cache_nodes.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_sweeps.clone()))?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_accepted,
            records_dropped,
            records_committed,
            batches_flushed,
            flush_attempt_errors,
            batch_flush_failures,
            flush_duration,
            batch_size,
            queue_depth,
            cache_nodes,
            cache_evictions,
            cache_sweeps,
            sweep_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
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

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_and_rendered() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.records_accepted.inc();
        health
            .records_dropped
            .with_label_values(&["queue_full"])
            .inc_by(3.0);
        health.cache_nodes.set(2.0);

        let text = health.render().expect("render");
        assert!(text.contains("netquality_records_accepted_total 1"));
        assert!(text.contains("netquality_records_dropped_total{reason=\"queue_full\"} 3"));
        assert!(text.contains("netquality_cache_nodes 2"));
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
        // Stopping twice is harmless.
        health.stop().await.expect("second stop");
    }
}
