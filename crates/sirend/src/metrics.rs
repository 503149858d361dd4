use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state. The accept loop marks it not-ready while the
/// connection table is full, and shutdown marks it not-ready for good;
/// `/ready` reports 503 in both cases.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if binding the metrics HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ok",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Counter helpers for server events.
pub mod counters {
    /// Packets processed, labelled by direction (`in` / `out`).
    pub fn packets_total(direction: &'static str) {
        metrics::counter!("sirend_packets_total", "direction" => direction).increment(1);
    }

    /// Payloads dropped before reaching the wire, labelled by reason.
    pub fn payloads_dropped_total(reason: &'static str) {
        metrics::counter!("sirend_payloads_dropped_total", "reason" => reason).increment(1);
    }

    /// Directory lookups served, labelled by scope (`local` / `external`).
    pub fn directory_lookups_total(scope: &'static str) {
        metrics::counter!("sirend_directory_lookups_total", "scope" => scope).increment(1);
    }

    /// Outbound federation dial attempts, labelled by outcome.
    pub fn federation_dials_total(outcome: &'static str) {
        metrics::counter!("sirend_federation_dials_total", "outcome" => outcome).increment(1);
    }
}

/// Gauge helpers for server state.
pub mod gauges {
    /// Increment the live connection gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("sirend_connections_active").increment(1.0);
    }

    /// Decrement the live connection gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("sirend_connections_active").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_toggles() {
        let state = HealthState::new();
        assert!(state.is_ready());
        state.set_ready(false);
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
    }
}
