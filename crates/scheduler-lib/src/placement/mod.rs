//! Resource-aware placement of communities onto nodes

mod packer;
mod snapshot;

pub use packer::{
    CommunityPlacement, PlacementCandidate, PlacementPacker, PlacementPlan, UnplacedReplica,
};
pub use snapshot::{
    replica_footprints, ClusterResourceSnapshot, NodeResourceSamples, NodeResources,
    PodResourceSamples, ResourceCapacity,
};
