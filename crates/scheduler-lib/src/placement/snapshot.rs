//! Cluster resource snapshot
//!
//! Built once per cycle from resource-provider rows and mutated in place
//! while the packer places replicas. Never shared between cycles.

use crate::models::{ReplicaFootprint, ResourceSample, TrafficGraph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Capacity of one resource type on one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub available: f64,
    pub allocation: f64,
    pub requested: f64,
}

impl ResourceCapacity {
    /// `available = allocation - max(usage, requested)`
    pub fn new(allocation: f64, requested: f64, usage: f64) -> Self {
        Self {
            available: allocation - usage.max(requested),
            allocation,
            requested,
        }
    }

    pub fn fits(&self, amount: f64) -> bool {
        self.available >= amount
    }
}

/// Capacity of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub node: String,
    pub zone: Option<String>,
    pub cpu: ResourceCapacity,
    pub memory: ResourceCapacity,
}

impl NodeResources {
    pub fn fits(&self, cpu: f64, memory: f64) -> bool {
        self.cpu.fits(cpu) && self.memory.fits(memory)
    }

    /// Take `cpu` and `memory` out of the available capacity
    ///
    /// Returns false and leaves the node untouched if it does not fit.
    pub fn reserve(&mut self, cpu: f64, memory: f64) -> bool {
        if !self.fits(cpu, memory) {
            return false;
        }
        self.cpu.available -= cpu;
        self.memory.available -= memory;
        true
    }
}

/// Node-level resource rows, one set per metric
#[derive(Debug, Clone, Default)]
pub struct NodeResourceSamples {
    pub cpu_allocatable: Vec<ResourceSample>,
    pub cpu_requested: Vec<ResourceSample>,
    pub cpu_used: Vec<ResourceSample>,
    pub memory_allocatable: Vec<ResourceSample>,
    pub memory_requested: Vec<ResourceSample>,
    pub memory_used: Vec<ResourceSample>,
    /// node -> failure zone
    pub zones: BTreeMap<String, String>,
}

/// Pod-level resource rows, one set per metric
#[derive(Debug, Clone, Default)]
pub struct PodResourceSamples {
    pub cpu_requested: Vec<ResourceSample>,
    pub cpu_used: Vec<ResourceSample>,
    pub memory_requested: Vec<ResourceSample>,
    pub memory_used: Vec<ResourceSample>,
    /// pod -> owning service
    pub services: BTreeMap<String, String>,
}

impl PodResourceSamples {
    /// Nodes each pod reported resource rows from
    fn pod_nodes(&self) -> BTreeSet<(&str, &str)> {
        [
            &self.cpu_requested,
            &self.cpu_used,
            &self.memory_requested,
            &self.memory_used,
        ]
        .into_iter()
        .flatten()
        .filter_map(|s| Some((s.pod.as_deref()?, s.node.as_str())))
        .filter(|(pod, _)| !pod.is_empty())
        .collect()
    }
}

fn sum_by_node(samples: &[ResourceSample]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for sample in samples {
        *totals.entry(sample.node.clone()).or_insert(0.0) += sample.value;
    }
    totals
}

fn peak_by_pod(samples: &[ResourceSample]) -> BTreeMap<(String, String), f64> {
    let mut peaks: BTreeMap<(String, String), f64> = BTreeMap::new();
    for sample in samples {
        let Some(pod) = &sample.pod else {
            continue;
        };
        let entry = peaks
            .entry((pod.clone(), sample.node.clone()))
            .or_insert(0.0);
        *entry = entry.max(sample.value);
    }
    peaks
}

fn node_value(totals: &BTreeMap<String, f64>, node: &str) -> f64 {
    totals.get(node).copied().unwrap_or(0.0)
}

fn pod_value(peaks: &BTreeMap<(String, String), f64>, pod: &str, node: &str) -> f64 {
    peaks
        .get(&(pod.to_string(), node.to_string()))
        .copied()
        .unwrap_or(0.0)
}

/// Per-node available capacity for one scheduling run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceSnapshot {
    nodes: BTreeMap<String, NodeResources>,
}

impl ClusterResourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from node-level rows
    ///
    /// Only nodes reporting both CPU and memory allocatable are included;
    /// missing request or usage rows count as zero.
    pub fn from_samples(samples: &NodeResourceSamples) -> Self {
        let cpu_alloc = sum_by_node(&samples.cpu_allocatable);
        let cpu_req = sum_by_node(&samples.cpu_requested);
        let cpu_used = sum_by_node(&samples.cpu_used);
        let mem_alloc = sum_by_node(&samples.memory_allocatable);
        let mem_req = sum_by_node(&samples.memory_requested);
        let mem_used = sum_by_node(&samples.memory_used);

        let mut snapshot = Self::new();
        for (node, cpu_allocation) in &cpu_alloc {
            let Some(memory_allocation) = mem_alloc.get(node) else {
                debug!(node = %node, "Skipping node without memory allocatable");
                continue;
            };

            snapshot.insert(NodeResources {
                node: node.clone(),
                zone: samples.zones.get(node).cloned(),
                cpu: ResourceCapacity::new(
                    *cpu_allocation,
                    node_value(&cpu_req, node),
                    node_value(&cpu_used, node),
                ),
                memory: ResourceCapacity::new(
                    *memory_allocation,
                    node_value(&mem_req, node),
                    node_value(&mem_used, node),
                ),
            });
        }
        snapshot
    }

    pub fn insert(&mut self, node: NodeResources) {
        self.nodes.insert(node.node.clone(), node);
    }

    pub fn get(&self, node: &str) -> Option<&NodeResources> {
        self.nodes.get(node)
    }

    pub fn get_mut(&mut self, node: &str) -> Option<&mut NodeResources> {
        self.nodes.get_mut(node)
    }

    /// Nodes in name order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeResources> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Replica footprints per service
///
/// A service's replicas are the (pod, node) pairs seen on its outgoing edges
/// plus every pod labelled with the service, so services that only receive
/// traffic are placed too. Each resource takes the peak reading reported
/// for the pod.
pub fn replica_footprints(
    graph: &TrafficGraph,
    pods: &PodResourceSamples,
) -> BTreeMap<String, Vec<ReplicaFootprint>> {
    let cpu_req = peak_by_pod(&pods.cpu_requested);
    let cpu_used = peak_by_pod(&pods.cpu_used);
    let mem_req = peak_by_pod(&pods.memory_requested);
    let mem_used = peak_by_pod(&pods.memory_used);

    // service -> pod -> node
    let mut replicas: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for source in &graph.app_links {
        let entry = replicas.entry(source.source.as_str()).or_default();
        for replica in source.targets.iter().flat_map(|link| link.replicas.iter()) {
            if !replica.pod.is_empty() {
                entry
                    .entry(replica.pod.as_str())
                    .or_insert(replica.node.as_str());
            }
        }
    }

    let services = graph.services();
    for (pod, node) in pods.pod_nodes() {
        let Some(service) = pods.services.get(pod) else {
            continue;
        };
        if !services.contains(service) {
            continue;
        }
        replicas
            .entry(service.as_str())
            .or_default()
            .entry(pod)
            .or_insert(node);
    }

    replicas
        .into_iter()
        .map(|(service, pods)| {
            let footprints = pods
                .into_iter()
                .map(|(pod, node)| ReplicaFootprint {
                    service: service.to_string(),
                    pod: pod.to_string(),
                    node: node.to_string(),
                    cpu_usage: pod_value(&cpu_used, pod, node),
                    cpu_requested: pod_value(&cpu_req, pod, node),
                    memory_usage: pod_value(&mem_used, pod, node),
                    memory_requested: pod_value(&mem_req, pod, node),
                })
                .collect();
            (service.to_string(), footprints)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_uses_peak_of_usage_and_request() {
        let cap = ResourceCapacity::new(4.0, 1.0, 2.5);
        assert_eq!(cap.available, 1.5);

        let cap = ResourceCapacity::new(4.0, 3.0, 2.5);
        assert_eq!(cap.available, 1.0);
    }

    #[test]
    fn test_snapshot_from_samples() {
        let samples = NodeResourceSamples {
            cpu_allocatable: vec![ResourceSample::node("n1", 8.0), ResourceSample::node("n2", 4.0)],
            cpu_requested: vec![ResourceSample::node("n1", 2.0), ResourceSample::node("n1", 1.0)],
            cpu_used: vec![ResourceSample::node("n1", 1.0)],
            memory_allocatable: vec![ResourceSample::node("n1", 1024.0)],
            memory_requested: vec![],
            memory_used: vec![ResourceSample::node("n1", 256.0)],
            zones: BTreeMap::from([("n1".to_string(), "zone-a".to_string())]),
        };

        let snapshot = ClusterResourceSnapshot::from_samples(&samples);

        // n2 has no memory allocatable
        assert_eq!(snapshot.len(), 1);
        let n1 = snapshot.get("n1").unwrap();
        assert_eq!(n1.cpu.available, 5.0);
        assert_eq!(n1.cpu.requested, 3.0);
        assert_eq!(n1.memory.available, 768.0);
        assert_eq!(n1.zone.as_deref(), Some("zone-a"));
    }

    fn shop_graph() -> TrafficGraph {
        use crate::community::CommunityDistribution;
        use crate::models::{AppLink, ReplicaSample, SourceNode};

        TrafficGraph {
            namespace: "shop".to_string(),
            total_exch_bytes: 1.0,
            total_msg_size: 1.0,
            total_msgs: 1.0,
            total_latency: 1.0,
            total_weight_affinity: 1.0,
            app_links: vec![SourceNode {
                source: "A".to_string(),
                communities_prob: CommunityDistribution::singleton("A"),
                degree_source_targets_affinity: 1.0,
                targets: vec![AppLink {
                    source: "A".to_string(),
                    target: "B".to_string(),
                    replicas: vec![ReplicaSample {
                        pod: "a-0".to_string(),
                        node: "n1".to_string(),
                        ..Default::default()
                    }],
                    link_bytes_exchanged: 1.0,
                    link_messages_size: 1.0,
                    link_total_messages: 1.0,
                    link_total_latency: 1.0,
                    affinity: 1.0,
                }],
            }],
        }
    }

    #[test]
    fn test_receiving_service_gets_labelled_pods() {
        let pods = PodResourceSamples {
            cpu_requested: vec![
                ResourceSample::pod("n1", "a-0", 0.5),
                ResourceSample::pod("n2", "b-0", 2.0),
                ResourceSample::pod("n2", "x-0", 1.0),
            ],
            memory_used: vec![ResourceSample::pod("n2", "b-0", 128.0)],
            services: BTreeMap::from([
                ("a-0".to_string(), "A".to_string()),
                ("b-0".to_string(), "B".to_string()),
                ("x-0".to_string(), "X".to_string()),
            ]),
            ..Default::default()
        };

        let footprints = replica_footprints(&shop_graph(), &pods);

        // X sends and receives nothing in this namespace
        assert_eq!(footprints.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(footprints["A"].len(), 1);
        assert_eq!(footprints["A"][0].node, "n1");

        let b = &footprints["B"];
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].pod, "b-0");
        assert_eq!(b[0].node, "n2");
        assert_eq!(b[0].cpu(), 2.0);
        assert_eq!(b[0].memory(), 128.0);
    }

    #[test]
    fn test_reserve_never_goes_negative() {
        let mut node = NodeResources {
            node: "n1".to_string(),
            zone: None,
            cpu: ResourceCapacity::new(2.0, 0.0, 0.0),
            memory: ResourceCapacity::new(100.0, 0.0, 0.0),
        };

        assert!(node.reserve(1.5, 10.0));
        assert!(!node.reserve(1.0, 10.0));
        assert_eq!(node.cpu.available, 0.5);
        assert_eq!(node.memory.available, 90.0);
    }
}
