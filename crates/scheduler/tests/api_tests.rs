//! Integration tests for the scheduler API endpoints

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use dashmap::DashMap;
use modsoft_scheduler::{
    api::{create_router, AppState},
    schedule::{CachedDecision, PlacementCache},
};
use scheduler_lib::{
    affinity::RawTrafficMetrics,
    health::{components, HealthRegistry},
    models::{MetricSample, ResourceSample},
    observability::SchedulerMetrics,
    pipeline::{CycleInputs, ResourceInputs},
    placement::{NodeResourceSamples, PodResourceSamples},
    provider::{MetricsProvider, ResourceProvider, TrafficMetric},
    CycleOutcome, CycleReport, NoDataReason, PipelineBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct NoTraffic;

#[async_trait]
impl MetricsProvider for NoTraffic {
    async fn traffic(
        &self,
        _namespace: &str,
        _window: Duration,
        _metric: TrafficMetric,
    ) -> Result<Vec<MetricSample>> {
        Ok(vec![])
    }
}

struct NoResources;

#[async_trait]
impl ResourceProvider for NoResources {
    async fn node_resources(&self, _window: Duration) -> Result<NodeResourceSamples> {
        Ok(NodeResourceSamples::default())
    }

    async fn pod_resources(&self, _namespace: &str, _window: Duration) -> Result<PodResourceSamples> {
        Ok(PodResourceSamples::default())
    }
}

/// Report for one A -> B edge packed onto a single node
fn shop_report() -> CycleReport {
    let pipeline = PipelineBuilder::new()
        .metrics(Arc::new(NoTraffic))
        .resources(Arc::new(NoResources))
        .build()
        .unwrap();

    let row = MetricSample::new("A", "B", "n1", "a-0", 10.0);
    let traffic = RawTrafficMetrics {
        request_bytes_sum: vec![row.clone()],
        request_bytes_count: vec![row.clone()],
        request_messages: vec![row.clone()],
        latency: vec![row],
        ..Default::default()
    };
    let resources = ResourceInputs {
        nodes: NodeResourceSamples {
            cpu_allocatable: vec![ResourceSample::node("n1", 4.0)],
            memory_allocatable: vec![ResourceSample::node("n1", 1024.0)],
            ..Default::default()
        },
        pods: PodResourceSamples {
            cpu_used: vec![ResourceSample::pod("n1", "a-0", 1.0)],
            ..Default::default()
        },
    };

    match pipeline.compute(CycleInputs {
        namespace: "shop".to_string(),
        traffic,
        service_graph: None,
        resources: Some(resources),
    }) {
        CycleOutcome::Placed(report) => report,
        other => panic!("expected a placement, got {:?}", other),
    }
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::METRICS_PROVIDER).await;
    health_registry.register(components::RESOURCE_PROVIDER).await;

    let placements: PlacementCache = Arc::new(DashMap::new());
    let state = Arc::new(AppState::new(
        health_registry,
        SchedulerMetrics::new(),
        placements,
    ));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["metrics_provider"].is_object());
    assert!(health["components"]["resource_provider"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_degraded(components::METRICS_PROVIDER, "traffic query timed out")
        .await;

    let (status, body) = get(app, "/healthz").await;

    // Degraded is still operational
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_unhealthy(components::RESOURCE_PROVIDER, "connection refused")
        .await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_loop_starts() {
    let (app, state) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;

    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::METRICS_PROVIDER, "Failed")
        .await;

    let (status, _) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;
    state.metrics.observe_cycle_latency(Duration::from_millis(30));
    state.metrics.record_outcome(
        "shop",
        &CycleOutcome::NoData(NoDataReason::NoEligibleEdges),
    );

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("modsoft_cycle_latency_seconds_bucket"));
    assert!(metrics_text.contains("modsoft_cycles_total"));
}

#[tokio::test]
async fn test_placement_missing_namespace_is_404() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/placements/unknown").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(error["error"].as_str().unwrap().contains("unknown"));
}

#[tokio::test]
async fn test_placement_returns_cached_decision() {
    let (app, state) = setup_test_app().await;
    state.placements.insert(
        "shop".to_string(),
        CachedDecision {
            namespace: "shop".to_string(),
            updated_at: Utc::now(),
            report: shop_report(),
        },
    );

    let (status, body) = get(app.clone(), "/placements/shop").await;

    assert_eq!(status, StatusCode::OK);
    let decision: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(decision["namespace"], "shop");
    let communities = decision["report"]["plan"]["communities"].as_array().unwrap();
    let placed: Vec<&serde_json::Value> = communities
        .iter()
        .filter_map(|c| c["members"]["A"].as_array())
        .flatten()
        .collect();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0]["node"], "n1");
    assert_eq!(placed[0]["cpu"], 3.0);

    let (status, body) = get(app, "/placements").await;
    assert_eq!(status, StatusCode::OK);
    let index: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(index[0]["namespace"], "shop");
    assert_eq!(index[0]["placed"], 1);
}
