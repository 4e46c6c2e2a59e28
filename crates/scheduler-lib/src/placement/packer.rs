//! Community-aware bin packing
//!
//! Communities are placed most-coupled first, and within a community the
//! largest replicas go first (best-fit decreasing). Every placement takes its
//! footprint out of the snapshot so later placements in the same run see the
//! reduced capacity.

use super::snapshot::ClusterResourceSnapshot;
use crate::community::Communities;
use crate::error::ModSoftError;
use crate::models::ReplicaFootprint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// A replica placed on a node, with the node's projected availability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementCandidate {
    pub pod: String,
    pub node: String,
    /// CPU left on the node after this placement
    pub cpu: f64,
    /// Memory left on the node after this placement
    pub mem: f64,
}

/// A replica no node could take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnplacedReplica {
    pub service: String,
    pub pod: String,
    pub current_node: String,
    pub cpu: f64,
    pub memory: f64,
}

/// Placements of one community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityPlacement {
    /// Representative community id
    pub community: String,
    pub internal_affinity: f64,
    /// service -> placed replicas
    pub members: BTreeMap<String, Vec<PlacementCandidate>>,
}

/// Placement decision for one namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub namespace: String,
    /// Communities in the order they were packed
    pub communities: Vec<CommunityPlacement>,
    pub unplaced: Vec<UnplacedReplica>,
}

impl PlacementPlan {
    pub fn community(&self, id: &str) -> Option<&CommunityPlacement> {
        self.communities.iter().find(|c| c.community == id)
    }

    pub fn placed_count(&self) -> usize {
        self.communities
            .iter()
            .flat_map(|c| c.members.values())
            .map(Vec::len)
            .sum()
    }

    pub fn unplaced_count(&self) -> usize {
        self.unplaced.len()
    }
}

/// Greedy community packer
#[derive(Debug, Clone)]
pub struct PlacementPacker {
    spread_zones: bool,
}

impl Default for PlacementPacker {
    fn default() -> Self {
        Self { spread_zones: true }
    }
}

impl PlacementPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable best-effort zone spreading
    pub fn with_zone_spreading(mut self, enabled: bool) -> Self {
        self.spread_zones = enabled;
        self
    }

    /// Pack every community's replicas onto the snapshot
    ///
    /// Fails with [`ModSoftError::ResourceUnavailable`] before touching the
    /// snapshot if it holds no nodes.
    pub fn pack(
        &self,
        namespace: &str,
        communities: &Communities,
        internal_affinity: &BTreeMap<String, f64>,
        replicas: &BTreeMap<String, Vec<ReplicaFootprint>>,
        snapshot: &mut ClusterResourceSnapshot,
    ) -> Result<PlacementPlan, ModSoftError> {
        if snapshot.is_empty() {
            return Err(ModSoftError::ResourceUnavailable {
                namespace: namespace.to_string(),
            });
        }

        let mut order: Vec<(&String, f64)> = communities
            .members()
            .keys()
            .map(|id| (id, internal_affinity.get(id).copied().unwrap_or(0.0)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut plan = PlacementPlan {
            namespace: namespace.to_string(),
            communities: Vec::with_capacity(order.len()),
            unplaced: Vec::new(),
        };

        for (community, affinity) in order {
            let members = &communities.members()[community];
            let placement =
                self.pack_community(community, affinity, members, replicas, snapshot, &mut plan.unplaced);
            plan.communities.push(placement);
        }

        info!(
            namespace = %namespace,
            communities = plan.communities.len(),
            placed = plan.placed_count(),
            unplaced = plan.unplaced_count(),
            "Packed communities onto nodes"
        );

        Ok(plan)
    }

    fn pack_community(
        &self,
        community: &str,
        internal_affinity: f64,
        members: &BTreeSet<String>,
        replicas: &BTreeMap<String, Vec<ReplicaFootprint>>,
        snapshot: &mut ClusterResourceSnapshot,
        unplaced: &mut Vec<UnplacedReplica>,
    ) -> CommunityPlacement {
        let mut queue: Vec<&ReplicaFootprint> = members
            .iter()
            .filter_map(|service| replicas.get(service))
            .flatten()
            .collect();
        queue.sort_by(footprint_order);

        // service -> replicas still waiting in the queue
        let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
        for replica in &queue {
            *remaining.entry(replica.service.as_str()).or_insert(0) += 1;
        }

        let mut placement = CommunityPlacement {
            community: community.to_string(),
            internal_affinity,
            members: BTreeMap::new(),
        };
        let mut community_nodes: BTreeSet<String> = BTreeSet::new();
        // service -> zones of replicas placed so far
        let mut service_zones: BTreeMap<&str, Vec<Option<String>>> = BTreeMap::new();

        for replica in queue {
            let (cpu, memory) = (replica.cpu(), replica.memory());
            let placed_zones = service_zones.entry(replica.service.as_str()).or_default();
            let left = remaining.entry(replica.service.as_str()).or_insert(1);
            let is_last = *left == 1;
            *left = left.saturating_sub(1);

            // Last chance to avoid concentrating the service in one zone
            let avoid_zone = if self.spread_zones && is_last && !placed_zones.is_empty() {
                single_zone(placed_zones)
            } else {
                None
            };

            let candidates = candidate_nodes(replica, &community_nodes, snapshot);
            let fits = |node: &&String| {
                snapshot
                    .get(node)
                    .map_or(false, |n| n.fits(cpu, memory))
            };

            let spread_choice = avoid_zone.as_ref().and_then(|zone| {
                candidates.iter().find(|node| {
                    fits(node)
                        && snapshot
                            .get(node)
                            .map_or(false, |n| n.zone.as_ref() != Some(zone))
                })
            });
            let chosen = spread_choice
                .or_else(|| candidates.iter().find(|node| fits(node)))
                .cloned();

            let Some(node_name) = chosen else {
                warn!(
                    community = %community,
                    service = %replica.service,
                    pod = %replica.pod,
                    cpu,
                    memory,
                    "No node has capacity for replica"
                );
                unplaced.push(UnplacedReplica {
                    service: replica.service.clone(),
                    pod: replica.pod.clone(),
                    current_node: replica.node.clone(),
                    cpu,
                    memory,
                });
                continue;
            };

            let Some(node) = snapshot.get_mut(&node_name) else {
                continue;
            };
            node.reserve(cpu, memory);

            debug!(
                community = %community,
                pod = %replica.pod,
                node = %node_name,
                cpu_left = node.cpu.available,
                memory_left = node.memory.available,
                "Placed replica"
            );

            placed_zones.push(node.zone.clone());
            placement
                .members
                .entry(replica.service.clone())
                .or_default()
                .push(PlacementCandidate {
                    pod: replica.pod.clone(),
                    node: node_name.clone(),
                    cpu: node.cpu.available,
                    mem: node.memory.available,
                });
            community_nodes.insert(node_name);
        }

        placement
    }
}

/// Largest CPU first, then largest memory, then pod name
fn footprint_order(a: &&ReplicaFootprint, b: &&ReplicaFootprint) -> Ordering {
    b.cpu()
        .total_cmp(&a.cpu())
        .then_with(|| b.memory().total_cmp(&a.memory()))
        .then_with(|| a.pod.cmp(&b.pod))
        .then_with(|| a.service.cmp(&b.service))
}

/// Current node, then nodes already used by the community, then the rest
fn candidate_nodes(
    replica: &ReplicaFootprint,
    community_nodes: &BTreeSet<String>,
    snapshot: &ClusterResourceSnapshot,
) -> Vec<String> {
    let mut candidates = Vec::with_capacity(snapshot.len());
    if snapshot.get(&replica.node).is_some() {
        candidates.push(replica.node.clone());
    }
    for node in community_nodes {
        if *node != replica.node {
            candidates.push(node.clone());
        }
    }
    for node in snapshot.nodes() {
        if node.node != replica.node && !community_nodes.contains(&node.node) {
            candidates.push(node.node.clone());
        }
    }
    candidates
}

/// The one zone shared by every placed replica, if there is exactly one
fn single_zone(zones: &[Option<String>]) -> Option<String> {
    let first = zones.first()?.clone()?;
    zones
        .iter()
        .all(|z| z.as_deref() == Some(first.as_str()))
        .then_some(first)
}
