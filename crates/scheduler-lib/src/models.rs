//! Core data models for the affinity placement pipeline

use crate::community::{CommunityDistribution, Memberships};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One row returned by the metrics provider for a traffic metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub source: String,
    pub target: String,
    pub node: String,
    pub replica_pod: String,
    pub value: f64,
}

impl MetricSample {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        node: impl Into<String>,
        replica_pod: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            node: node.into(),
            replica_pod: replica_pod.into(),
            value,
        }
    }

    /// Key used to match the request and response side of one replica
    pub fn replica_key(&self) -> ReplicaKey {
        ReplicaKey {
            node: self.node.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            replica_pod: self.replica_pod.clone(),
        }
    }
}

/// Identity of a per-replica reading on one edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaKey {
    pub node: String,
    pub source: String,
    pub target: String,
    pub replica_pod: String,
}

impl ReplicaKey {
    pub fn into_sample(self, value: f64) -> MetricSample {
        MetricSample {
            source: self.source,
            target: self.target,
            node: self.node,
            replica_pod: self.replica_pod,
            value,
        }
    }
}

/// Per-replica contribution to one edge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSample {
    pub pod: String,
    pub node: String,
    pub sum_bytes: f64,
    pub count_bytes: f64,
    pub total_messages: f64,
    pub latency: f64,
}

/// A directed edge between two communicating services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppLink {
    pub source: String,
    pub target: String,
    pub replicas: Vec<ReplicaSample>,
    pub link_bytes_exchanged: f64,
    pub link_messages_size: f64,
    pub link_total_messages: f64,
    pub link_total_latency: f64,
    pub affinity: f64,
}

impl AppLink {
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// All outgoing edges of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    pub source: String,
    pub communities_prob: CommunityDistribution,
    pub degree_source_targets_affinity: f64,
    pub targets: Vec<AppLink>,
}

/// Traffic-affinity graph of one namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficGraph {
    pub namespace: String,
    pub total_exch_bytes: f64,
    pub total_msg_size: f64,
    pub total_msgs: f64,
    pub total_latency: f64,
    pub total_weight_affinity: f64,
    /// Source nodes ordered by service name
    pub app_links: Vec<SourceNode>,
}

impl TrafficGraph {
    /// Iterate over every edge, grouped by source
    pub fn edges(&self) -> impl Iterator<Item = &AppLink> {
        self.app_links.iter().flat_map(|node| node.targets.iter())
    }

    pub fn edge_count(&self) -> usize {
        self.app_links.iter().map(|node| node.targets.len()).sum()
    }

    /// Every service appearing as a source or a target
    pub fn services(&self) -> BTreeSet<String> {
        let mut services = BTreeSet::new();
        for link in self.edges() {
            services.insert(link.source.clone());
            services.insert(link.target.clone());
        }
        services
    }

    pub fn source(&self, name: &str) -> Option<&SourceNode> {
        self.app_links.iter().find(|node| node.source == name)
    }

    /// Copy optimized memberships back onto the source nodes
    pub fn apply_memberships(&mut self, memberships: &Memberships) {
        for node in &mut self.app_links {
            if let Some(dist) = memberships.get(&node.source) {
                node.communities_prob = dist.clone();
            }
        }
    }
}

/// One row returned by the resource provider
///
/// Node-level rows leave `pod` empty; pod-level rows carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub node: String,
    pub pod: Option<String>,
    pub value: f64,
}

impl ResourceSample {
    pub fn node(node: impl Into<String>, value: f64) -> Self {
        Self {
            node: node.into(),
            pod: None,
            value,
        }
    }

    pub fn pod(node: impl Into<String>, pod: impl Into<String>, value: f64) -> Self {
        Self {
            node: node.into(),
            pod: Some(pod.into()),
            value,
        }
    }
}

/// Observed resource consumption of one running replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaFootprint {
    pub service: String,
    pub pod: String,
    pub node: String,
    pub cpu_usage: f64,
    pub cpu_requested: f64,
    pub memory_usage: f64,
    pub memory_requested: f64,
}

impl ReplicaFootprint {
    /// CPU the replica occupies: the peak of usage and request
    pub fn cpu(&self) -> f64 {
        self.cpu_usage.max(self.cpu_requested)
    }

    /// Memory the replica occupies: the peak of usage and request
    pub fn memory(&self) -> f64 {
        self.memory_usage.max(self.memory_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(source: &str, target: &str) -> AppLink {
        AppLink {
            source: source.to_string(),
            target: target.to_string(),
            replicas: vec![],
            link_bytes_exchanged: 0.0,
            link_messages_size: 0.0,
            link_total_messages: 0.0,
            link_total_latency: 0.0,
            affinity: 0.0,
        }
    }

    #[test]
    fn test_services_include_sinks() {
        let graph = TrafficGraph {
            namespace: "default".to_string(),
            total_exch_bytes: 0.0,
            total_msg_size: 0.0,
            total_msgs: 0.0,
            total_latency: 0.0,
            total_weight_affinity: 0.0,
            app_links: vec![SourceNode {
                source: "a".to_string(),
                communities_prob: CommunityDistribution::singleton("a"),
                degree_source_targets_affinity: 0.0,
                targets: vec![link("a", "b"), link("a", "c")],
            }],
        };

        let services: Vec<_> = graph.services().into_iter().collect();
        assert_eq!(services, vec!["a", "b", "c"]);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.source("b").is_none());
    }

    #[test]
    fn test_footprint_takes_peak() {
        let replica = ReplicaFootprint {
            service: "a".to_string(),
            pod: "a-0".to_string(),
            node: "n1".to_string(),
            cpu_usage: 0.3,
            cpu_requested: 0.5,
            memory_usage: 512.0,
            memory_requested: 256.0,
        };
        assert_eq!(replica.cpu(), 0.5);
        assert_eq!(replica.memory(), 512.0);
    }
}
