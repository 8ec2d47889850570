//! Health and liveness probes.
//!
//! `/health` reports relay counters and per-destination dispatcher state;
//! `/live` only proves the HTTP server is answering.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hermes_delivery::{CircuitStatus, DispatcherSnapshot, RelayStats};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall relay status.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Relay counters.
    pub relay: RelayStats,
    /// State of every dispatcher spawned so far.
    pub dispatchers: Vec<DispatcherSnapshot>,
    /// Service version.
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every circuit is closed.
    Healthy,
    /// At least one destination's circuit is open or probing.
    Degraded,
    /// The relay is shutting down.
    Unhealthy,
}

impl HealthStatus {
    fn assess(shutting_down: bool, dispatchers: &[DispatcherSnapshot]) -> Self {
        if shutting_down {
            Self::Unhealthy
        } else if dispatchers.iter().all(|d| d.circuit.status == CircuitStatus::Closed) {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }
}

/// Health check endpoint handler.
///
/// A degraded relay still answers 200: other destinations keep flowing
/// while one circuit is open. Only a relay that has stopped intake
/// answers 503.
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let relay = state.relay.stats().await;
    let dispatchers = state.relay.dispatcher_snapshots().await;
    let status = HealthStatus::assess(state.relay.is_shutting_down(), &dispatchers);

    let status_code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(?status, in_flight = relay.in_flight, "health check completed");

    let response = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        relay,
        dispatchers,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
#[instrument(name = "liveness_check", skip_all)]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "hermes",
    });

    (StatusCode::OK, Json(response)).into_response()
}
