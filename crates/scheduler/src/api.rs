//! HTTP API for health checks, Prometheus metrics and placement decisions

use crate::schedule::PlacementCache;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use scheduler_lib::{
    health::HealthRegistry,
    observability::SchedulerMetrics,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SchedulerMetrics,
    pub placements: PlacementCache,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: SchedulerMetrics,
        placements: PlacementCache,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            placements,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// One line of the placement index
#[derive(Debug, Serialize)]
struct PlacementSummary {
    namespace: String,
    updated_at: DateTime<Utc>,
    communities: usize,
    modularity: f64,
    placed: usize,
    unplaced: usize,
}

/// Returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Summaries of every cached decision, by namespace
async fn list_placements(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut summaries: Vec<PlacementSummary> = state
        .placements
        .iter()
        .map(|entry| {
            let report = &entry.report;
            let (placed, unplaced) = report
                .plan
                .as_ref()
                .map_or((0, 0), |plan| (plan.placed_count(), plan.unplaced_count()));
            PlacementSummary {
                namespace: entry.namespace.clone(),
                updated_at: entry.updated_at,
                communities: report.communities.len(),
                modularity: report.modularity,
                placed,
                unplaced,
            }
        })
        .collect();
    summaries.sort_by(|a, b| a.namespace.cmp(&b.namespace));

    Json(summaries)
}

/// Latest decision for one namespace, 404 if none was made yet
async fn get_placement(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> axum::response::Response {
    match state.placements.get(&namespace) {
        Some(entry) => (StatusCode::OK, Json(entry.value().clone())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no placement decision for namespace {namespace}"),
            }),
        )
            .into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/placements", get(list_placements))
        .route("/placements/:namespace", get(get_placement))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
