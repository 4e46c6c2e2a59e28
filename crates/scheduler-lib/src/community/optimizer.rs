//! Soft modularity optimization
//!
//! Every service holds a probability distribution over communities. The
//! objective contrasts the affinity observed between services sharing a
//! community against the density expected under independence:
//!
//! ```text
//! Q = -sum_c (sum_i P_i(c) * avg_i)^2 + rho / W * sum_(i,j) w_ij * sum_c P_i(c) * P_j(c)
//! ```
//!
//! With singleton memberships the first term is `-sum_i avg_i^2`. Self-loop
//! edges count twice.
//!
//! Membership moves are greedy and fractional: a sweep visits services in
//! name order and blends part of a service's mass into a neighbouring
//! community only when that strictly raises Q, so Q never decreases.

use super::CommunityDistribution;
use crate::affinity::AverageProbabilities;
use crate::error::ModSoftError;
use crate::models::TrafficGraph;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Community distribution per service name
pub type Memberships = BTreeMap<String, CommunityDistribution>;

/// Smallest gain that counts as an improvement of Q
const GAIN_EPSILON: f64 = 1e-12;

/// Configuration for the modularity optimizer
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Resolution parameter scaling the observed-density term
    pub resolution: f64,
    /// Minimum Q improvement per sweep to keep iterating
    pub tolerance: f64,
    /// Maximum number of sweeps
    pub max_iterations: usize,
    /// Fractions of membership mass a single move may transfer
    pub step_sizes: Vec<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            tolerance: 1e-6,
            max_iterations: 100,
            step_sizes: vec![0.25, 0.5, 1.0],
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ModSoftError> {
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(ModSoftError::InvalidOptimizer(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ModSoftError::InvalidOptimizer(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        if self.step_sizes.is_empty()
            || self
                .step_sizes
                .iter()
                .any(|s| !s.is_finite() || *s <= 0.0 || *s > 1.0)
        {
            return Err(ModSoftError::InvalidOptimizer(format!(
                "step sizes must lie in (0, 1], got {:?}",
                self.step_sizes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct WeightedEdge {
    source: String,
    target: String,
    weight: f64,
}

/// The soft modularity objective of one traffic graph
#[derive(Debug, Clone)]
pub struct SoftModularity {
    average: AverageProbabilities,
    edges: Vec<WeightedEdge>,
    service_count: usize,
    total_weight: f64,
    resolution: f64,
}

impl SoftModularity {
    pub fn new(graph: &TrafficGraph, average: &AverageProbabilities, resolution: f64) -> Self {
        let edges = graph
            .edges()
            .map(|link| WeightedEdge {
                source: link.source.clone(),
                target: link.target.clone(),
                weight: if link.is_self_loop() {
                    2.0 * link.affinity
                } else {
                    link.affinity
                },
            })
            .collect();

        Self {
            average: average.clone(),
            edges,
            service_count: graph.services().len(),
            total_weight: graph.total_weight_affinity,
            resolution,
        }
    }

    /// True when Q is identically zero for every assignment
    pub fn is_trivial(&self) -> bool {
        self.service_count <= 1 || self.edges.is_empty() || self.total_weight <= 0.0
    }

    /// Evaluate Q for a membership assignment
    pub fn evaluate(&self, memberships: &Memberships) -> f64 {
        if self.is_trivial() {
            return 0.0;
        }
        -self.expected_density(memberships)
            + self.resolution * self.observed_density(memberships) / self.total_weight
    }

    /// Density expected under independence
    pub fn expected_density(&self, memberships: &Memberships) -> f64 {
        let mut mass: BTreeMap<&str, f64> = BTreeMap::new();
        for (service, share) in &self.average {
            if let Some(dist) = memberships.get(service) {
                for (community, p) in dist.iter() {
                    *mass.entry(community).or_insert(0.0) += p * share;
                }
            }
        }
        mass.values().map(|m| m * m).sum()
    }

    /// Edge weight falling inside shared communities
    fn observed_density(&self, memberships: &Memberships) -> f64 {
        self.edges
            .iter()
            .map(|edge| {
                match (memberships.get(&edge.source), memberships.get(&edge.target)) {
                    (Some(p_i), Some(p_j)) => edge.weight * p_i.overlap(p_j),
                    _ => 0.0,
                }
            })
            .sum()
    }

    /// Undirected neighbour sets, including the service itself
    fn neighbours(&self, services: &BTreeSet<String>) -> BTreeMap<String, BTreeSet<String>> {
        let mut neighbours: BTreeMap<String, BTreeSet<String>> = services
            .iter()
            .map(|s| (s.clone(), BTreeSet::from([s.clone()])))
            .collect();
        for edge in &self.edges {
            if let Some(set) = neighbours.get_mut(&edge.source) {
                set.insert(edge.target.clone());
            }
            if let Some(set) = neighbours.get_mut(&edge.target) {
                set.insert(edge.source.clone());
            }
        }
        neighbours
    }
}

/// Outcome of an optimization run
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub memberships: Memberships,
    pub initial_modularity: f64,
    pub modularity: f64,
    /// Q after each completed sweep
    pub history: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Iteratively improves soft modularity over community memberships
#[derive(Debug, Clone, Default)]
pub struct ModularityOptimizer {
    config: OptimizerConfig,
}

/// Singleton self-membership for every service in the graph
pub fn initial_memberships(graph: &TrafficGraph) -> Memberships {
    graph
        .services()
        .into_iter()
        .map(|service| {
            let dist = CommunityDistribution::singleton(&service);
            (service, dist)
        })
        .collect()
}

impl ModularityOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Run sweeps until Q stops improving or the iteration cap is hit
    pub fn optimize(&self, graph: &TrafficGraph, average: &AverageProbabilities) -> OptimizationResult {
        let objective = SoftModularity::new(graph, average, self.config.resolution);
        let mut memberships = initial_memberships(graph);

        if objective.is_trivial() {
            return OptimizationResult {
                memberships,
                initial_modularity: 0.0,
                modularity: 0.0,
                history: Vec::new(),
                iterations: 0,
                converged: true,
            };
        }

        let services: BTreeSet<String> = memberships.keys().cloned().collect();
        let neighbours = objective.neighbours(&services);

        let initial_modularity = objective.evaluate(&memberships);
        let mut modularity = initial_modularity;
        let mut history = Vec::new();
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            let next = self.sweep(&objective, &neighbours, &mut memberships, modularity);
            history.push(next);
            let gain = next - modularity;
            modularity = next;

            debug!(iteration, modularity, gain, "Modularity sweep complete");

            if gain < self.config.tolerance {
                converged = true;
                break;
            }
        }

        OptimizationResult {
            memberships,
            initial_modularity,
            modularity,
            iterations: history.len(),
            history,
            converged,
        }
    }

    /// One pass of local moves over all services in name order
    ///
    /// Returns the Q of the resulting assignment, never lower than `current`.
    pub fn sweep(
        &self,
        objective: &SoftModularity,
        neighbours: &BTreeMap<String, BTreeSet<String>>,
        memberships: &mut Memberships,
        mut current: f64,
    ) -> f64 {
        for (service, adjacent) in neighbours {
            let Some(original) = memberships.get(service).cloned() else {
                continue;
            };

            let candidates: BTreeSet<String> = adjacent
                .iter()
                .filter_map(|n| memberships.get(n))
                .flat_map(|d| d.communities().map(str::to_string))
                .collect();

            let mut best: Option<(f64, CommunityDistribution)> = None;
            for community in &candidates {
                for &alpha in &self.config.step_sizes {
                    let trial = original.blend_toward(community, alpha);
                    if trial == original {
                        continue;
                    }
                    memberships.insert(service.clone(), trial.clone());
                    let q = objective.evaluate(memberships);
                    let threshold = best.as_ref().map_or(current, |(best_q, _)| *best_q);
                    if q > threshold + GAIN_EPSILON {
                        best = Some((q, trial));
                    }
                }
            }

            match best {
                Some((q, dist)) => {
                    memberships.insert(service.clone(), dist);
                    current = q;
                }
                None => {
                    memberships.insert(service.clone(), original);
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{
        aggregate_degrees, average_probabilities, AffinityGraphBuilder, GraphOutcome,
        TrafficMetrics,
    };
    use crate::models::MetricSample;

    fn graph_from(edges: &[(&str, &str, f64)]) -> (TrafficGraph, AverageProbabilities) {
        let samples: Vec<MetricSample> = edges
            .iter()
            .map(|(src, dst, v)| MetricSample::new(*src, *dst, "n1", format!("{}-0", src), *v))
            .collect();
        let metrics = TrafficMetrics {
            bytes_exchanged: samples.clone(),
            message_size: samples.clone(),
            total_messages: samples.clone(),
            latency: samples,
        };
        let mut graph = match AffinityGraphBuilder::default().build("shop", &metrics) {
            GraphOutcome::Built(graph) => graph,
            GraphOutcome::NoData(reason) => panic!("unexpected no data: {}", reason),
        };
        aggregate_degrees(&mut graph);
        let avg = average_probabilities(&graph);
        (graph, avg)
    }

    /// Two dense triangles joined by a thin bridge
    fn two_clusters() -> (TrafficGraph, AverageProbabilities) {
        graph_from(&[
            ("a1", "a2", 50.0),
            ("a2", "a3", 50.0),
            ("a3", "a1", 50.0),
            ("b1", "b2", 50.0),
            ("b2", "b3", 50.0),
            ("b3", "b1", 50.0),
            ("a3", "b1", 1.0),
        ])
    }

    #[test]
    fn test_initial_modularity_is_negative_expected_density() {
        let (graph, avg) = graph_from(&[("a", "b", 5.0), ("b", "c", 5.0)]);
        let objective = SoftModularity::new(&graph, &avg, 1.0);
        let q = objective.evaluate(&initial_memberships(&graph));

        let expected: f64 = avg.values().map(|p| p * p).sum();
        assert!((q + expected).abs() < 1e-12);
    }

    #[test]
    fn test_self_loop_counts_double() {
        let (graph, avg) = graph_from(&[("a", "a", 5.0), ("a", "b", 5.0)]);
        let objective = SoftModularity::new(&graph, &avg, 1.0);
        let q = objective.evaluate(&initial_memberships(&graph));

        // avg(a) = 1, self loop carries 0.5 affinity counted twice
        assert!((q - 0.0).abs() < 1e-9, "q was {}", q);
    }

    #[test]
    fn test_sweeps_never_decrease_modularity() {
        let (graph, avg) = two_clusters();
        let result = ModularityOptimizer::default().optimize(&graph, &avg);

        let mut previous = result.initial_modularity;
        for q in &result.history {
            assert!(*q >= previous, "modularity dropped from {} to {}", previous, q);
            previous = *q;
        }
        assert!(result.modularity > result.initial_modularity);
    }

    #[test]
    fn test_detects_two_clusters() {
        let (graph, avg) = two_clusters();
        let result = ModularityOptimizer::default().optimize(&graph, &avg);

        let dominant = |s: &str| result.memberships[s].dominant().0.to_string();
        assert_eq!(dominant("a1"), dominant("a2"));
        assert_eq!(dominant("a2"), dominant("a3"));
        assert_eq!(dominant("b1"), dominant("b2"));
        assert_eq!(dominant("b2"), dominant("b3"));
        assert_ne!(dominant("a1"), dominant("b1"));
    }

    #[test]
    fn test_memberships_stay_normalized() {
        let (graph, avg) = two_clusters();
        let result = ModularityOptimizer::default().optimize(&graph, &avg);

        for dist in result.memberships.values() {
            let sum: f64 = dist.iter().map(|(_, p)| p).sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_optimization_is_deterministic() {
        let (graph, avg) = two_clusters();
        let first = ModularityOptimizer::default().optimize(&graph, &avg);
        let second = ModularityOptimizer::default().optimize(&graph, &avg);

        assert_eq!(first.memberships, second.memberships);
        assert_eq!(first.history, second.history);
    }

    #[test]
    fn test_single_service_is_trivial() {
        let (graph, avg) = graph_from(&[("a", "a", 5.0)]);
        let result = ModularityOptimizer::default().optimize(&graph, &avg);

        assert_eq!(result.modularity, 0.0);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.memberships["a"], CommunityDistribution::singleton("a"));
    }

    #[test]
    fn test_iteration_cap() {
        let (graph, avg) = two_clusters();
        let config = OptimizerConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let result = ModularityOptimizer::new(config).optimize(&graph, &avg);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::default().validate().is_ok());

        let bad = OptimizerConfig {
            step_sizes: vec![0.0],
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = OptimizerConfig {
            resolution: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
