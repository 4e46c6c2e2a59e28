//! Affinity graph builder
//!
//! Joins the four per-replica traffic dimensions into directed service
//! edges and scores each edge with a weighted share of namespace traffic.

use super::normalizer::{dedup_zero_samples, merge_sides};
use super::{
    round_to, AFFINITY_PRECISION, BYTES_PRECISION, COUNT_PRECISION, LATENCY_PRECISION,
};
use crate::community::CommunityDistribution;
use crate::error::{ModSoftError, NoDataReason, TrafficDimension};
use crate::models::{AppLink, MetricSample, ReplicaSample, SourceNode, TrafficGraph};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Weights of each traffic share in the affinity score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffinityWeights {
    pub bytes_exchanged: f64,
    pub message_size: f64,
    pub total_messages: f64,
    pub latency: f64,
}

impl Default for AffinityWeights {
    fn default() -> Self {
        Self {
            bytes_exchanged: 0.2,
            message_size: 0.1,
            total_messages: 0.4,
            latency: 0.3,
        }
    }
}

impl AffinityWeights {
    /// Check that weights are non-negative and form a convex combination
    pub fn validate(&self) -> Result<(), ModSoftError> {
        let weights = [
            self.bytes_exchanged,
            self.message_size,
            self.total_messages,
            self.latency,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ModSoftError::InvalidWeights(format!(
                "weights must be finite and non-negative, got {:?}",
                weights
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ModSoftError::InvalidWeights(format!(
                "weights must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Traffic metric sets exactly as returned by the metrics provider
#[derive(Debug, Clone, Default)]
pub struct RawTrafficMetrics {
    pub request_bytes_sum: Vec<MetricSample>,
    pub response_bytes_sum: Vec<MetricSample>,
    pub request_bytes_count: Vec<MetricSample>,
    pub response_bytes_count: Vec<MetricSample>,
    pub request_messages: Vec<MetricSample>,
    pub response_messages: Vec<MetricSample>,
    pub tcp_connections: Vec<MetricSample>,
    pub latency: Vec<MetricSample>,
}

/// The four normalized per-replica traffic dimensions
#[derive(Debug, Clone, Default)]
pub struct TrafficMetrics {
    pub bytes_exchanged: Vec<MetricSample>,
    pub message_size: Vec<MetricSample>,
    pub total_messages: Vec<MetricSample>,
    pub latency: Vec<MetricSample>,
}

impl TrafficMetrics {
    /// Deduplicate every raw set and merge request/response sides
    ///
    /// TCP connection counts are folded into the request side of the
    /// message count before it is merged with the response side.
    pub fn from_raw(raw: RawTrafficMetrics) -> Self {
        let bytes_exchanged = merge_sides(
            dedup_zero_samples(raw.request_bytes_sum),
            dedup_zero_samples(raw.response_bytes_sum),
            BYTES_PRECISION,
        );
        let message_size = merge_sides(
            dedup_zero_samples(raw.request_bytes_count),
            dedup_zero_samples(raw.response_bytes_count),
            COUNT_PRECISION,
        );
        let request_side = merge_sides(
            dedup_zero_samples(raw.request_messages),
            dedup_zero_samples(raw.tcp_connections),
            COUNT_PRECISION,
        );
        let total_messages = merge_sides(
            request_side,
            dedup_zero_samples(raw.response_messages),
            COUNT_PRECISION,
        );
        let latency = merge_sides(dedup_zero_samples(raw.latency), Vec::new(), LATENCY_PRECISION);

        Self {
            bytes_exchanged,
            message_size,
            total_messages,
            latency,
        }
    }

    /// First dimension with no samples at all, if any
    pub fn missing_dimension(&self) -> Option<TrafficDimension> {
        self.dimensions()
            .into_iter()
            .find(|(_, samples)| samples.is_empty())
            .map(|(dim, _)| dim)
    }

    fn dimensions(&self) -> [(TrafficDimension, &[MetricSample]); 4] {
        [
            (TrafficDimension::BytesExchanged, self.bytes_exchanged.as_slice()),
            (TrafficDimension::MessageSize, self.message_size.as_slice()),
            (TrafficDimension::TotalMessages, self.total_messages.as_slice()),
            (TrafficDimension::Latency, self.latency.as_slice()),
        ]
    }
}

/// Result of building a traffic graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOutcome {
    Built(TrafficGraph),
    NoData(NoDataReason),
}

/// Builds a [`TrafficGraph`] from normalized traffic metrics
#[derive(Debug, Clone, Default)]
pub struct AffinityGraphBuilder {
    weights: AffinityWeights,
    eligible_pairs: Option<BTreeSet<(String, String)>>,
}

impl AffinityGraphBuilder {
    pub fn new(weights: AffinityWeights) -> Self {
        Self {
            weights,
            eligible_pairs: None,
        }
    }

    /// Restrict edges to (source, target) pairs present in a service graph
    pub fn with_eligible_pairs(mut self, pairs: BTreeSet<(String, String)>) -> Self {
        self.eligible_pairs = Some(pairs);
        self
    }

    fn is_eligible(&self, source: &str, target: &str) -> bool {
        match &self.eligible_pairs {
            None => true,
            Some(pairs) => pairs.contains(&(source.to_string(), target.to_string())),
        }
    }

    /// Build the graph for `namespace`
    pub fn build(&self, namespace: &str, metrics: &TrafficMetrics) -> GraphOutcome {
        if let Some(dim) = metrics.missing_dimension() {
            return GraphOutcome::NoData(NoDataReason::NoCommunication(dim));
        }

        // (source, target) -> (pod, node) -> replica
        let mut edges: BTreeMap<(String, String), BTreeMap<(String, String), ReplicaSample>> =
            BTreeMap::new();

        for (dim, samples) in metrics.dimensions() {
            for sample in samples {
                if !self.is_eligible(&sample.source, &sample.target) {
                    continue;
                }
                let replica = edges
                    .entry((sample.source.clone(), sample.target.clone()))
                    .or_default()
                    .entry((sample.replica_pod.clone(), sample.node.clone()))
                    .or_insert_with(|| ReplicaSample {
                        pod: sample.replica_pod.clone(),
                        node: sample.node.clone(),
                        ..Default::default()
                    });
                match dim {
                    TrafficDimension::BytesExchanged => replica.sum_bytes += sample.value,
                    TrafficDimension::MessageSize => replica.count_bytes += sample.value,
                    TrafficDimension::TotalMessages => replica.total_messages += sample.value,
                    TrafficDimension::Latency => replica.latency += sample.value,
                }
            }
        }

        if edges.is_empty() {
            return GraphOutcome::NoData(NoDataReason::NoEligibleEdges);
        }

        let mut links: Vec<AppLink> = edges
            .into_iter()
            .map(|((source, target), replicas)| fold_link(source, target, replicas))
            .collect();

        let total_exch_bytes = round_to(
            links.iter().map(|l| l.link_bytes_exchanged).sum(),
            BYTES_PRECISION,
        );
        let total_msg_size = round_to(
            links.iter().map(|l| l.link_messages_size).sum(),
            COUNT_PRECISION,
        );
        let total_msgs = round_to(
            links.iter().map(|l| l.link_total_messages).sum(),
            COUNT_PRECISION,
        );
        let total_latency = round_to(
            links.iter().map(|l| l.link_total_latency).sum(),
            LATENCY_PRECISION,
        );

        for link in &mut links {
            let affinity = self.weights.bytes_exchanged
                * share(link.link_bytes_exchanged, total_exch_bytes)
                + self.weights.message_size * share(link.link_messages_size, total_msg_size)
                + self.weights.total_messages * share(link.link_total_messages, total_msgs)
                + self.weights.latency * share(link.link_total_latency, total_latency);
            link.affinity = round_to(affinity, AFFINITY_PRECISION).clamp(0.0, 1.0);
        }

        let mut app_links: Vec<SourceNode> = Vec::new();
        for link in links {
            match app_links.last_mut() {
                Some(node) if node.source == link.source => node.targets.push(link),
                _ => app_links.push(SourceNode {
                    source: link.source.clone(),
                    communities_prob: CommunityDistribution::singleton(&link.source),
                    degree_source_targets_affinity: 0.0,
                    targets: vec![link],
                }),
            }
        }

        debug!(
            namespace = %namespace,
            sources = app_links.len(),
            total_exch_bytes,
            total_msgs,
            "Built traffic graph"
        );

        GraphOutcome::Built(TrafficGraph {
            namespace: namespace.to_string(),
            total_exch_bytes,
            total_msg_size,
            total_msgs,
            total_latency,
            total_weight_affinity: 0.0,
            app_links,
        })
    }
}

/// Sum replica readings into edge aggregates
fn fold_link(
    source: String,
    target: String,
    replicas: BTreeMap<(String, String), ReplicaSample>,
) -> AppLink {
    let replicas: Vec<ReplicaSample> = replicas.into_values().collect();

    AppLink {
        link_bytes_exchanged: round_to(
            replicas.iter().map(|r| r.sum_bytes).sum(),
            BYTES_PRECISION,
        ),
        link_messages_size: round_to(
            replicas.iter().map(|r| r.count_bytes).sum(),
            COUNT_PRECISION,
        ),
        link_total_messages: round_to(
            replicas.iter().map(|r| r.total_messages).sum(),
            COUNT_PRECISION,
        ),
        link_total_latency: round_to(
            replicas.iter().map(|r| r.latency).sum(),
            LATENCY_PRECISION,
        ),
        source,
        target,
        replicas,
        affinity: 0.0,
    }
}

/// Fraction of a namespace total; a zero total contributes nothing
fn share(value: f64, total: f64) -> f64 {
    if total > 0.0 {
        value / total
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(source: &str, target: &str, pod: &str, value: f64) -> MetricSample {
        MetricSample::new(source, target, "n1", pod, value)
    }

    /// Equal traffic on every dimension for the given edges
    fn uniform_metrics(edges: &[(&str, &str)]) -> TrafficMetrics {
        let samples: Vec<MetricSample> = edges
            .iter()
            .map(|(src, dst)| s(src, dst, &format!("{}-0", src), 10.0))
            .collect();
        TrafficMetrics {
            bytes_exchanged: samples.clone(),
            message_size: samples.clone(),
            total_messages: samples.clone(),
            latency: samples,
        }
    }

    fn built(outcome: GraphOutcome) -> TrafficGraph {
        match outcome {
            GraphOutcome::Built(graph) => graph,
            GraphOutcome::NoData(reason) => panic!("expected graph, got {}", reason),
        }
    }

    #[test]
    fn test_single_edge_scenario() {
        let raw = RawTrafficMetrics {
            request_bytes_sum: vec![s("a", "b", "a-0", 100.0)],
            response_bytes_sum: vec![s("a", "b", "a-0", 50.0)],
            request_bytes_count: vec![s("a", "b", "a-0", 10.0)],
            response_bytes_count: vec![s("a", "b", "a-0", 5.0)],
            request_messages: vec![s("a", "b", "a-0", 10.0)],
            response_messages: vec![s("a", "b", "a-0", 5.0)],
            tcp_connections: vec![],
            latency: vec![s("a", "b", "a-0", 2.0)],
        };

        let metrics = TrafficMetrics::from_raw(raw);
        let graph = built(AffinityGraphBuilder::default().build("shop", &metrics));

        let link = graph.edges().next().unwrap();
        assert_eq!(link.link_bytes_exchanged, 150.0);
        assert_eq!(link.link_total_messages, 15.0);
        assert_eq!(link.link_total_latency, 2.0);
        assert_eq!(graph.total_exch_bytes, 150.0);
        assert_eq!(graph.total_msg_size, 15.0);
        assert_eq!(graph.total_msgs, 15.0);
        assert_eq!(graph.total_latency, 2.0);
        assert_eq!(link.affinity, 1.0);
        assert_eq!(link.replicas.len(), 1);
    }

    #[test]
    fn test_chain_splits_affinity_evenly() {
        let metrics = uniform_metrics(&[("a", "b"), ("b", "c")]);
        let graph = built(AffinityGraphBuilder::default().build("shop", &metrics));

        assert_eq!(graph.app_links.len(), 2);
        for link in graph.edges() {
            assert_eq!(link.affinity, 0.5);
        }
    }

    #[test]
    fn test_affinities_sum_to_one() {
        let metrics = TrafficMetrics {
            bytes_exchanged: vec![s("a", "b", "a-0", 300.0), s("b", "c", "b-0", 700.0), s("c", "a", "c-0", 11.0)],
            message_size: vec![s("a", "b", "a-0", 3.0), s("b", "c", "b-0", 9.0), s("c", "a", "c-0", 1.0)],
            total_messages: vec![s("a", "b", "a-0", 31.0), s("b", "c", "b-0", 17.0), s("c", "a", "c-0", 2.0)],
            latency: vec![s("a", "b", "a-0", 0.7), s("b", "c", "b-0", 1.3), s("c", "a", "c-0", 0.4)],
        };

        let graph = built(AffinityGraphBuilder::default().build("shop", &metrics));
        let total: f64 = graph.edges().map(|l| l.affinity).sum();

        assert!((total - 1.0).abs() < 1e-4, "sum was {}", total);
        assert!(graph.edges().all(|l| (0.0..=1.0).contains(&l.affinity)));
    }

    #[test]
    fn test_replicas_fold_into_one_edge() {
        let metrics = TrafficMetrics {
            bytes_exchanged: vec![s("a", "b", "a-0", 10.0), s("a", "b", "a-1", 30.0)],
            message_size: vec![s("a", "b", "a-0", 1.0), s("a", "b", "a-1", 1.0)],
            total_messages: vec![s("a", "b", "a-0", 2.0)],
            latency: vec![s("a", "b", "a-1", 0.5)],
        };

        let graph = built(AffinityGraphBuilder::default().build("shop", &metrics));
        let link = graph.edges().next().unwrap();

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(link.replicas.len(), 2);
        assert_eq!(link.link_bytes_exchanged, 40.0);
        assert_eq!(link.link_total_messages, 2.0);
        // a-1 never reported messages, so its count stays zero
        assert_eq!(link.replicas[1].total_messages, 0.0);
    }

    #[test]
    fn test_zero_total_dimension_contributes_nothing() {
        let mut metrics = uniform_metrics(&[("a", "b")]);
        metrics.latency = vec![s("a", "b", "a-0", 0.0)];

        let graph = built(AffinityGraphBuilder::default().build("shop", &metrics));
        let link = graph.edges().next().unwrap();

        assert_eq!(graph.total_latency, 0.0);
        assert_eq!(link.affinity, 0.7);
    }

    #[test]
    fn test_missing_dimension_is_no_data() {
        let mut metrics = uniform_metrics(&[("a", "b")]);
        metrics.total_messages.clear();

        let outcome = AffinityGraphBuilder::default().build("shop", &metrics);
        assert_eq!(
            outcome,
            GraphOutcome::NoData(NoDataReason::NoCommunication(TrafficDimension::TotalMessages))
        );
    }

    #[test]
    fn test_eligible_pairs_filter_edges() {
        let metrics = uniform_metrics(&[("a", "b"), ("b", "c")]);
        let eligible = BTreeSet::from([("a".to_string(), "b".to_string())]);

        let graph = built(
            AffinityGraphBuilder::default()
                .with_eligible_pairs(eligible)
                .build("shop", &metrics),
        );
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges().next().unwrap().affinity, 1.0);

        let outcome = AffinityGraphBuilder::default()
            .with_eligible_pairs(BTreeSet::new())
            .build("shop", &metrics);
        assert_eq!(outcome, GraphOutcome::NoData(NoDataReason::NoEligibleEdges));
    }

    #[test]
    fn test_tcp_connections_fold_into_messages() {
        let raw = RawTrafficMetrics {
            request_bytes_sum: vec![s("a", "b", "a-0", 1.0)],
            request_bytes_count: vec![s("a", "b", "a-0", 1.0)],
            request_messages: vec![s("a", "b", "a-0", 4.0)],
            response_messages: vec![s("a", "b", "a-0", 2.0)],
            tcp_connections: vec![s("a", "b", "a-0", 3.0)],
            latency: vec![s("a", "b", "a-0", 1.0)],
            ..Default::default()
        };

        let metrics = TrafficMetrics::from_raw(raw);
        assert_eq!(metrics.total_messages.len(), 1);
        assert_eq!(metrics.total_messages[0].value, 9.0);
    }

    #[test]
    fn test_weights_validation() {
        assert!(AffinityWeights::default().validate().is_ok());

        let skewed = AffinityWeights {
            latency: 0.5,
            ..Default::default()
        };
        assert!(skewed.validate().is_err());

        let negative = AffinityWeights {
            bytes_exchanged: -0.2,
            message_size: 0.5,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
