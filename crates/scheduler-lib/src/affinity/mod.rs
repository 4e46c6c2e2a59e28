//! Traffic-affinity graph construction
//!
//! This module turns raw per-replica traffic samples into a weighted,
//! directed service graph:
//! - Zero-sample deduplication and request/response merging
//! - Per-edge aggregation and affinity scoring
//! - Degree aggregation and average outgoing-affinity shares

mod builder;
mod degree;
mod normalizer;

pub use builder::{AffinityGraphBuilder, AffinityWeights, GraphOutcome, RawTrafficMetrics, TrafficMetrics};
pub use degree::{aggregate_degrees, average_probabilities, AverageProbabilities};
pub use normalizer::{dedup_zero_samples, merge_sides};

/// Decimal places kept for byte sums
pub const BYTES_PRECISION: i32 = 2;

/// Decimal places kept for message and observation counts
pub const COUNT_PRECISION: i32 = 3;

/// Decimal places kept for latency sums
pub const LATENCY_PRECISION: i32 = 2;

/// Decimal places kept for affinities and probability shares
pub const AFFINITY_PRECISION: i32 = 5;

/// Round to `decimals` places, halves away from zero
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
