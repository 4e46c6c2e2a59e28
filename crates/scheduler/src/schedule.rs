//! Periodic scheduling loop
//!
//! Every tick runs one pipeline cycle per configured namespace. Namespaces
//! run concurrently and share nothing but the result cache; a cycle that
//! outlives its timeout is dropped and retried on the next tick.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scheduler_lib::{
    health::{components, HealthRegistry},
    observability::{SchedulerMetrics, StructuredLogger},
    CycleOutcome, CycleReport, NoDataReason, Pipeline,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Latest placement decision of one namespace
#[derive(Debug, Clone, Serialize)]
pub struct CachedDecision {
    pub namespace: String,
    pub updated_at: DateTime<Utc>,
    pub report: CycleReport,
}

/// Latest decision per namespace, shared with the API
pub type PlacementCache = Arc<DashMap<String, CachedDecision>>;

/// Result of one namespace task within a tick
enum CycleResult {
    Completed(CycleOutcome),
    TimedOut,
}

/// Drives the pipeline over all namespaces on a fixed interval
pub struct SchedulingLoop {
    pipeline: Arc<Pipeline>,
    namespaces: Vec<String>,
    interval: Duration,
    cycle_timeout: Duration,
    cache: PlacementCache,
    health: HealthRegistry,
    metrics: SchedulerMetrics,
    logger: StructuredLogger,
}

impl SchedulingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<Pipeline>,
        namespaces: Vec<String>,
        interval: Duration,
        cycle_timeout: Duration,
        cache: PlacementCache,
        health: HealthRegistry,
        metrics: SchedulerMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            pipeline,
            namespaces,
            interval,
            cycle_timeout,
            cache,
            health,
            metrics,
            logger,
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            namespaces = self.namespaces.len(),
            "Starting scheduling loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.health.set_ready(true).await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let completed = self.run_once().await;
                    debug!(completed, total = self.namespaces.len(), "Scheduling tick complete");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scheduling loop");
                    break;
                }
            }
        }
    }

    /// Run one cycle for every namespace; returns how many completed
    pub async fn run_once(&self) -> usize {
        let mut tasks = JoinSet::new();

        for namespace in &self.namespaces {
            let namespace = namespace.clone();
            let pipeline = self.pipeline.clone();
            let cycle_timeout = self.cycle_timeout;
            self.logger.log_cycle_start(&namespace);

            tasks.spawn(async move {
                let start = Instant::now();
                let result = match timeout(cycle_timeout, pipeline.run_cycle(&namespace)).await {
                    Ok(outcome) => CycleResult::Completed(outcome),
                    Err(_) => CycleResult::TimedOut,
                };
                (namespace, start.elapsed(), result)
            });
        }

        let mut completed = 0;
        let mut task_failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((namespace, elapsed, CycleResult::Completed(outcome))) => {
                    self.metrics.observe_cycle_latency(elapsed);
                    self.record(&namespace, outcome).await;
                    completed += 1;
                }
                Ok((namespace, elapsed, CycleResult::TimedOut)) => {
                    self.metrics.observe_cycle_latency(elapsed);
                    self.metrics.inc_cycle_failures();
                    self.logger.log_cycle_failure(
                        &namespace,
                        &format!("timed out after {}s", self.cycle_timeout.as_secs()),
                    );
                }
                Err(e) => {
                    task_failed = true;
                    self.metrics.inc_cycle_failures();
                    self.logger.log_cycle_failure("unknown", &e.to_string());
                    self.health
                        .set_degraded(components::SCHEDULING_LOOP, format!("cycle task failed: {e}"))
                        .await;
                }
            }
        }

        if !task_failed {
            self.health.set_healthy(components::SCHEDULING_LOOP).await;
        }
        completed
    }

    async fn record(&self, namespace: &str, outcome: CycleOutcome) {
        self.metrics.record_outcome(namespace, &outcome);
        self.logger.log_outcome(namespace, &outcome);
        self.update_health(&outcome).await;

        match outcome {
            CycleOutcome::Placed(report) => {
                self.cache.insert(
                    namespace.to_string(),
                    CachedDecision {
                        namespace: namespace.to_string(),
                        updated_at: Utc::now(),
                        report,
                    },
                );
            }
            // An older plan no longer describes the namespace
            CycleOutcome::NoData(_) | CycleOutcome::ResourcesUnavailable(_) => {
                if self.cache.remove(namespace).is_some() {
                    debug!(namespace = %namespace, "Evicted stale placement decision");
                }
            }
        }
    }

    async fn update_health(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::NoData(NoDataReason::TrafficUnavailable(e)) => {
                self.health
                    .set_degraded(components::METRICS_PROVIDER, e.clone())
                    .await;
            }
            CycleOutcome::NoData(NoDataReason::ServiceGraphUnavailable(e)) => {
                self.health
                    .set_degraded(components::GRAPH_PROVIDER, e.clone())
                    .await;
            }
            CycleOutcome::NoData(_) => {
                self.health.set_healthy(components::METRICS_PROVIDER).await;
            }
            CycleOutcome::ResourcesUnavailable(_) => {
                self.health.set_healthy(components::METRICS_PROVIDER).await;
                self.health
                    .set_degraded(components::RESOURCE_PROVIDER, "no node capacity available")
                    .await;
            }
            CycleOutcome::Placed(_) => {
                self.health.set_healthy(components::METRICS_PROVIDER).await;
                self.health.set_healthy(components::RESOURCE_PROVIDER).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use scheduler_lib::models::{MetricSample, ResourceSample};
    use scheduler_lib::placement::{NodeResourceSamples, PodResourceSamples};
    use scheduler_lib::provider::{MetricsProvider, ResourceProvider, TrafficMetric};
    use scheduler_lib::PipelineBuilder;

    /// Serves one A -> B edge in namespace "shop" and nothing elsewhere
    struct ShopTraffic {
        delay: Duration,
    }

    #[async_trait]
    impl MetricsProvider for ShopTraffic {
        async fn traffic(
            &self,
            namespace: &str,
            _window: Duration,
            metric: TrafficMetric,
        ) -> Result<Vec<MetricSample>> {
            tokio::time::sleep(self.delay).await;
            if namespace != "shop" || metric == TrafficMetric::TcpConnections {
                return Ok(vec![]);
            }
            Ok(vec![MetricSample::new("A", "B", "n1", "a-0", 10.0)])
        }
    }

    struct OneNode;

    #[async_trait]
    impl ResourceProvider for OneNode {
        async fn node_resources(&self, _window: Duration) -> Result<NodeResourceSamples> {
            Ok(NodeResourceSamples {
                cpu_allocatable: vec![ResourceSample::node("n1", 4.0)],
                memory_allocatable: vec![ResourceSample::node("n1", 1024.0)],
                ..Default::default()
            })
        }

        async fn pod_resources(
            &self,
            _namespace: &str,
            _window: Duration,
        ) -> Result<PodResourceSamples> {
            Ok(PodResourceSamples::default())
        }
    }

    fn scheduling_loop(delay: Duration, cycle_timeout: Duration) -> (SchedulingLoop, PlacementCache) {
        let pipeline = PipelineBuilder::new()
            .metrics(Arc::new(ShopTraffic { delay }))
            .resources(Arc::new(OneNode))
            .build()
            .unwrap();
        let cache: PlacementCache = Arc::new(DashMap::new());

        let scheduling_loop = SchedulingLoop::new(
            Arc::new(pipeline),
            vec!["shop".to_string(), "empty".to_string()],
            Duration::from_secs(60),
            cycle_timeout,
            cache.clone(),
            HealthRegistry::new(),
            SchedulerMetrics::new(),
            StructuredLogger::new("test"),
        );
        (scheduling_loop, cache)
    }

    #[tokio::test]
    async fn test_run_once_caches_placed_namespaces_only() {
        let (scheduling_loop, cache) = scheduling_loop(Duration::ZERO, Duration::from_secs(5));

        let completed = scheduling_loop.run_once().await;

        assert_eq!(completed, 2);
        assert!(cache.contains_key("shop"));
        assert!(!cache.contains_key("empty"));

        let decision = cache.get("shop").unwrap();
        assert_eq!(decision.report.namespace, "shop");
        assert!(decision.report.plan.is_some());
    }

    #[tokio::test]
    async fn test_run_once_evicts_decision_without_placement() {
        let (scheduling_loop, cache) = scheduling_loop(Duration::ZERO, Duration::from_secs(5));
        scheduling_loop.run_once().await;

        let previous = cache.get("shop").unwrap().clone();
        cache.insert(
            "empty".to_string(),
            CachedDecision {
                namespace: "empty".to_string(),
                ..previous
            },
        );

        scheduling_loop.run_once().await;

        assert!(cache.contains_key("shop"));
        assert!(!cache.contains_key("empty"));
    }

    #[tokio::test]
    async fn test_timed_out_cycle_is_abandoned() {
        let (scheduling_loop, cache) =
            scheduling_loop(Duration::from_millis(200), Duration::from_millis(10));

        let completed = scheduling_loop.run_once().await;

        assert_eq!(completed, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let (scheduling_loop, _cache) = scheduling_loop(Duration::ZERO, Duration::from_secs(5));
        let health = scheduling_loop.health.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(scheduling_loop.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        handle.await.unwrap();
        assert!(health.readiness().await.ready);
    }
}
