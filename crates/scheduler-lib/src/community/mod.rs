//! Community detection over the traffic-affinity graph
//!
//! This module provides:
//! - A typed fractional membership distribution
//! - The soft modularity objective and its greedy optimizer
//! - Hard and overlapping read-out of finalized communities

mod distribution;
mod optimizer;
mod readout;

pub use distribution::CommunityDistribution;
pub use optimizer::{
    initial_memberships, Memberships, ModularityOptimizer, OptimizationResult, OptimizerConfig,
    SoftModularity,
};
pub use readout::{overlapping_communities, Communities};
