//! Degree aggregation
//!
//! Rolls edge affinities up into per-source degrees and derives each
//! source's share of the total outgoing affinity. That share distribution is
//! the baseline the modularity objective is measured against.

use super::{round_to, AFFINITY_PRECISION};
use crate::models::TrafficGraph;
use std::collections::BTreeMap;

/// Average outgoing-affinity share per source service
pub type AverageProbabilities = BTreeMap<String, f64>;

/// Fill in per-source degrees and the graph-wide total weight
pub fn aggregate_degrees(graph: &mut TrafficGraph) {
    let mut total = 0.0;
    for node in &mut graph.app_links {
        let degree: f64 = node.targets.iter().map(|link| link.affinity).sum();
        node.degree_source_targets_affinity = round_to(degree, AFFINITY_PRECISION);
        total += node.degree_source_targets_affinity;
    }
    graph.total_weight_affinity = round_to(total, AFFINITY_PRECISION);
}

/// Share of total affinity carried by each source's outgoing edges
///
/// Services that only receive traffic have no entry. A graph with zero total
/// weight yields an empty map.
pub fn average_probabilities(graph: &TrafficGraph) -> AverageProbabilities {
    if graph.total_weight_affinity <= 0.0 {
        return AverageProbabilities::new();
    }

    graph
        .app_links
        .iter()
        .map(|node| {
            (
                node.source.clone(),
                round_to(
                    node.degree_source_targets_affinity / graph.total_weight_affinity,
                    AFFINITY_PRECISION,
                ),
            )
        })
        .collect()
}
