//! Reading finalized communities out of soft memberships

use super::Memberships;
use crate::models::TrafficGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Hard community assignment derived from soft memberships
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Communities {
    /// service -> community id
    assignments: BTreeMap<String, String>,
    /// community id -> member services
    members: BTreeMap<String, BTreeSet<String>>,
}

impl Communities {
    /// Assign each service to its most probable community
    pub fn from_memberships(memberships: &Memberships) -> Self {
        let mut communities = Self::default();
        for (service, dist) in memberships {
            let (community, _) = dist.dominant();
            communities.insert(service, community);
        }
        communities
    }

    fn insert(&mut self, service: &str, community: &str) {
        self.assignments
            .insert(service.to_string(), community.to_string());
        self.members
            .entry(community.to_string())
            .or_default()
            .insert(service.to_string());
    }

    pub fn community_of(&self, service: &str) -> Option<&str> {
        self.assignments.get(service).map(String::as_str)
    }

    pub fn members(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sum of edge affinity with both endpoints in the same community
    pub fn internal_affinity(&self, graph: &TrafficGraph) -> BTreeMap<String, f64> {
        let mut totals: BTreeMap<String, f64> =
            self.members.keys().map(|id| (id.clone(), 0.0)).collect();

        for link in graph.edges() {
            let (Some(src), Some(dst)) = (
                self.community_of(&link.source),
                self.community_of(&link.target),
            ) else {
                continue;
            };
            if src == dst {
                if let Some(total) = totals.get_mut(src) {
                    *total += link.affinity;
                }
            }
        }
        totals
    }
}

/// Overlapping read-out: every community holding at least `threshold` of a service
pub fn overlapping_communities(
    memberships: &Memberships,
    threshold: f64,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (service, dist) in memberships {
        for (community, p) in dist.iter() {
            if p >= threshold {
                members
                    .entry(community.to_string())
                    .or_default()
                    .insert(service.clone());
            }
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::CommunityDistribution;

    fn memberships() -> Memberships {
        let mixed = CommunityDistribution::new(BTreeMap::from([
            ("a".to_string(), 0.6),
            ("c".to_string(), 0.4),
        ]))
        .unwrap();

        BTreeMap::from([
            ("a".to_string(), CommunityDistribution::singleton("a")),
            ("b".to_string(), mixed),
            ("c".to_string(), CommunityDistribution::singleton("c")),
        ])
    }

    #[test]
    fn test_hard_assignment_takes_dominant() {
        let communities = Communities::from_memberships(&memberships());

        assert_eq!(communities.community_of("b"), Some("a"));
        assert_eq!(communities.len(), 2);
        assert_eq!(
            communities.members()["a"],
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_overlapping_readout() {
        let overlapping = overlapping_communities(&memberships(), 0.3);

        assert!(overlapping["a"].contains("b"));
        assert!(overlapping["c"].contains("b"));

        let strict = overlapping_communities(&memberships(), 0.5);
        assert!(!strict["c"].contains("b"));
    }
}
