//! ModSoft scheduler
//!
//! Periodically groups each namespace's services into traffic-affinity
//! communities and packs them onto nodes, serving the latest decisions
//! over HTTP.

use anyhow::{Context, Result};
use dashmap::DashMap;
use modsoft_scheduler::{
    api,
    config::SchedulerConfig,
    schedule::{PlacementCache, SchedulingLoop},
};
use scheduler_lib::{
    health::{components, HealthRegistry},
    observability::{SchedulerMetrics, StructuredLogger},
    provider::{KialiClient, PrometheusClient},
    PipelineBuilder,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SCHEDULER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting modsoft-scheduler");

    let config = SchedulerConfig::load()?;
    info!(
        namespaces = ?config.namespaces,
        prometheus_url = %config.prometheus_url,
        kiali_enabled = config.kiali_url.is_some(),
        "Scheduler configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::METRICS_PROVIDER).await;
    health_registry.register(components::RESOURCE_PROVIDER).await;
    health_registry.register(components::SCHEDULING_LOOP).await;

    let metrics = SchedulerMetrics::new();
    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(SCHEDULER_VERSION, &config.namespaces);

    let prometheus = Arc::new(
        PrometheusClient::new(&config.prometheus_url).context("Failed to create metrics client")?,
    );
    let mut builder = PipelineBuilder::new()
        .config(config.pipeline_config())
        .metrics(prometheus.clone())
        .resources(prometheus);

    if let Some(kiali_url) = &config.kiali_url {
        let kiali = KialiClient::new(kiali_url)
            .context("Failed to create service graph client")?
            .with_duration(config.pipeline_config().window);
        builder = builder.service_graph(Arc::new(kiali));
        health_registry.register(components::GRAPH_PROVIDER).await;
    }
    let pipeline = Arc::new(builder.build()?);

    let placements: PlacementCache = Arc::new(DashMap::new());
    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduling_loop = SchedulingLoop::new(
        pipeline,
        config.namespaces.clone(),
        config.cycle_interval(),
        config.cycle_timeout(),
        placements.clone(),
        health_registry.clone(),
        metrics.clone(),
        logger.clone(),
    );
    let loop_handle = tokio::spawn(scheduling_loop.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry, metrics, placements));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Scheduling loop ended abnormally");
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
