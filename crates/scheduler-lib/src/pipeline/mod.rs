//! Per-namespace scheduling cycle
//!
//! A cycle fetches traffic, resources and (optionally) the service graph
//! concurrently, then runs the synchronous chain:
//! normalize -> build graph -> aggregate degrees -> optimize -> pack.
//!
//! Missing input never fails the cycle. It ends in [`CycleOutcome::NoData`]
//! or, when only resources are missing, [`CycleOutcome::ResourcesUnavailable`]
//! with the community result still attached.

use crate::affinity::{
    aggregate_degrees, average_probabilities, AffinityGraphBuilder, AffinityWeights,
    AverageProbabilities, GraphOutcome, RawTrafficMetrics, TrafficMetrics,
};
use crate::community::{Communities, Memberships, ModularityOptimizer, OptimizerConfig};
use crate::error::{ModSoftError, NoDataReason};
use crate::models::TrafficGraph;
use crate::placement::{
    replica_footprints, ClusterResourceSnapshot, NodeResourceSamples, PlacementPacker,
    PlacementPlan, PodResourceSamples,
};
use crate::provider::{
    fetch_raw_traffic, MetricsProvider, ResourceProvider, ServiceGraph, ServiceGraphProvider,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};


/// Configuration for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window the traffic and usage metrics are aggregated over
    pub window: Duration,
    pub weights: AffinityWeights,
    pub optimizer: OptimizerConfig,
    /// Prefer spreading a service's last replica across zones
    pub zone_spreading: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            weights: AffinityWeights::default(),
            optimizer: OptimizerConfig::default(),
            zone_spreading: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ModSoftError> {
        self.weights.validate()?;
        self.optimizer.validate()
    }
}

/// Resource readings for one cycle
#[derive(Debug, Clone, Default)]
pub struct ResourceInputs {
    pub nodes: NodeResourceSamples,
    pub pods: PodResourceSamples,
}

/// Everything fetched for one namespace before computation starts
#[derive(Debug, Clone)]
pub struct CycleInputs {
    pub namespace: String,
    pub traffic: RawTrafficMetrics,
    /// `None` when no graph provider is configured
    pub service_graph: Option<ServiceGraph>,
    /// `None` when the resource fetch failed
    pub resources: Option<ResourceInputs>,
}

/// Result of a cycle that got as far as community detection
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub namespace: String,
    pub generated_at: DateTime<Utc>,
    pub graph: TrafficGraph,
    pub average_probabilities: AverageProbabilities,
    pub memberships: Memberships,
    pub communities: Communities,
    pub internal_affinity: BTreeMap<String, f64>,
    pub initial_modularity: f64,
    pub modularity: f64,
    pub iterations: usize,
    pub converged: bool,
    /// `None` when placement could not run
    pub plan: Option<PlacementPlan>,
}

/// How one namespace cycle ended
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Communities were detected and packed
    Placed(CycleReport),
    /// Nothing actionable this cycle
    NoData(NoDataReason),
    /// Communities were detected but no node capacity was available
    ResourcesUnavailable(CycleReport),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Placed(_) => "placed",
            CycleOutcome::NoData(_) => "no_data",
            CycleOutcome::ResourcesUnavailable(_) => "resources_unavailable",
        }
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Placed(report) | CycleOutcome::ResourcesUnavailable(report) => {
                Some(report)
            }
            CycleOutcome::NoData(_) => None,
        }
    }
}

/// Affinity placement pipeline bound to a set of providers
pub struct Pipeline {
    metrics: Arc<dyn MetricsProvider>,
    resources: Arc<dyn ResourceProvider>,
    service_graph: Option<Arc<dyn ServiceGraphProvider>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fetch inputs for `namespace` and run one full cycle
    pub async fn run_cycle(&self, namespace: &str) -> CycleOutcome {
        let window = self.config.window;

        let (traffic, service_graph, resources) = tokio::join!(
            fetch_raw_traffic(self.metrics.as_ref(), namespace, window),
            self.fetch_service_graph(namespace),
            self.fetch_resources(namespace, window),
        );

        let traffic = match traffic {
            Ok(traffic) => traffic,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Traffic fetch failed");
                return CycleOutcome::NoData(NoDataReason::TrafficUnavailable(format!("{e:#}")));
            }
        };

        let service_graph = match service_graph {
            Ok(graph) => graph,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Service graph fetch failed");
                return CycleOutcome::NoData(NoDataReason::ServiceGraphUnavailable(format!(
                    "{e:#}"
                )));
            }
        };

        let resources = match resources {
            Ok(resources) => Some(resources),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Resource fetch failed");
                None
            }
        };

        self.compute(CycleInputs {
            namespace: namespace.to_string(),
            traffic,
            service_graph,
            resources,
        })
    }

    async fn fetch_service_graph(&self, namespace: &str) -> Result<Option<ServiceGraph>> {
        match &self.service_graph {
            Some(provider) => Ok(Some(provider.service_graph(namespace).await?)),
            None => Ok(None),
        }
    }

    async fn fetch_resources(&self, namespace: &str, window: Duration) -> Result<ResourceInputs> {
        let (nodes, pods) = tokio::try_join!(
            self.resources.node_resources(window),
            self.resources.pod_resources(namespace, window),
        )?;
        Ok(ResourceInputs { nodes, pods })
    }

    /// Run the synchronous part of a cycle on already fetched inputs
    pub fn compute(&self, inputs: CycleInputs) -> CycleOutcome {
        let namespace = inputs.namespace.as_str();

        let mut builder = AffinityGraphBuilder::new(self.config.weights);
        if let Some(service_graph) = &inputs.service_graph {
            if service_graph.is_empty() {
                return CycleOutcome::NoData(NoDataReason::EmptyServiceGraph);
            }
            builder = builder.with_eligible_pairs(service_graph.eligible_pairs());
        }

        let metrics = TrafficMetrics::from_raw(inputs.traffic);
        let mut graph = match builder.build(namespace, &metrics) {
            GraphOutcome::Built(graph) => graph,
            GraphOutcome::NoData(reason) => {
                info!(namespace = %namespace, reason = %reason, "No traffic graph for namespace");
                return CycleOutcome::NoData(reason);
            }
        };

        aggregate_degrees(&mut graph);
        let average = average_probabilities(&graph);

        let optimizer = ModularityOptimizer::new(self.config.optimizer.clone());
        let result = optimizer.optimize(&graph, &average);
        graph.apply_memberships(&result.memberships);

        let communities = Communities::from_memberships(&result.memberships);
        let internal_affinity = communities.internal_affinity(&graph);

        debug!(
            namespace = %namespace,
            communities = communities.len(),
            modularity = result.modularity,
            iterations = result.iterations,
            "Communities detected"
        );

        let plan = inputs.resources.and_then(|resources| {
            let mut snapshot = ClusterResourceSnapshot::from_samples(&resources.nodes);
            let footprints = replica_footprints(&graph, &resources.pods);
            PlacementPacker::new()
                .with_zone_spreading(self.config.zone_spreading)
                .pack(
                    namespace,
                    &communities,
                    &internal_affinity,
                    &footprints,
                    &mut snapshot,
                )
                .map_err(|e| warn!(namespace = %namespace, error = %e, "Placement skipped"))
                .ok()
        });

        let placed = plan.is_some();
        let report = CycleReport {
            namespace: namespace.to_string(),
            generated_at: Utc::now(),
            graph,
            average_probabilities: average,
            memberships: result.memberships,
            communities,
            internal_affinity,
            initial_modularity: result.initial_modularity,
            modularity: result.modularity,
            iterations: result.iterations,
            converged: result.converged,
            plan,
        };

        if placed {
            CycleOutcome::Placed(report)
        } else {
            CycleOutcome::ResourcesUnavailable(report)
        }
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    metrics: Option<Arc<dyn MetricsProvider>>,
    resources: Option<Arc<dyn ResourceProvider>>,
    service_graph: Option<Arc<dyn ServiceGraphProvider>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            metrics: None,
            resources: None,
            service_graph: None,
            config: PipelineConfig::default(),
        }
    }

    /// Set the traffic metrics provider
    pub fn metrics(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = Some(provider);
        self
    }

    /// Set the node and pod resource provider
    pub fn resources(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(provider);
        self
    }

    /// Restrict traffic to pairs present in this provider's graph
    pub fn service_graph(mut self, provider: Arc<dyn ServiceGraphProvider>) -> Self {
        self.service_graph = Some(provider);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn weights(mut self, weights: AffinityWeights) -> Self {
        self.config.weights = weights;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.config.optimizer = optimizer;
        self
    }

    pub fn zone_spreading(mut self, enabled: bool) -> Self {
        self.config.zone_spreading = enabled;
        self
    }

    /// Build the pipeline, validating its configuration
    pub fn build(self) -> Result<Pipeline> {
        let metrics = self
            .metrics
            .ok_or_else(|| anyhow::anyhow!("Metrics provider is required"))?;
        let resources = self
            .resources
            .ok_or_else(|| anyhow::anyhow!("Resource provider is required"))?;
        self.config.validate()?;

        Ok(Pipeline {
            metrics,
            resources,
            service_graph: self.service_graph,
            config: self.config,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
