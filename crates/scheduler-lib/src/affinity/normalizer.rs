//! Metric sample normalization
//!
//! Replicas that restarted or were rescheduled leave stale zero-valued
//! series behind. These are dropped whenever the same replica reports a
//! non-zero value, but a replica that only ever reported zero keeps exactly
//! one zero sample so genuine "no traffic" readings survive.

use super::round_to;
use crate::models::{MetricSample, ReplicaKey};
use std::collections::{BTreeMap, HashSet};

type DedupKey = (String, String, String);

fn dedup_key(sample: &MetricSample) -> DedupKey {
    (
        sample.source.clone(),
        sample.target.clone(),
        sample.replica_pod.clone(),
    )
}

/// Drop redundant zero samples per (source, target, replica pod)
///
/// Order of the surviving samples is preserved. Running this twice yields
/// the same output as running it once.
pub fn dedup_zero_samples(samples: Vec<MetricSample>) -> Vec<MetricSample> {
    let with_traffic: HashSet<DedupKey> = samples
        .iter()
        .filter(|s| s.value != 0.0)
        .map(dedup_key)
        .collect();

    let mut zero_kept: HashSet<DedupKey> = HashSet::new();

    samples
        .into_iter()
        .filter(|sample| {
            if sample.value != 0.0 {
                return true;
            }
            let key = dedup_key(sample);
            if with_traffic.contains(&key) {
                return false;
            }
            zero_kept.insert(key)
        })
        .collect()
}

/// Merge the request and response side of a metric per replica
///
/// Samples are matched on (node, source, target, replica pod). Matching
/// readings are summed and rounded to `precision` decimals; a reading with no
/// counterpart is used as is. Output is ordered by replica key.
pub fn merge_sides(
    request: Vec<MetricSample>,
    response: Vec<MetricSample>,
    precision: i32,
) -> Vec<MetricSample> {
    let mut merged: BTreeMap<ReplicaKey, f64> = BTreeMap::new();

    for sample in request.into_iter().chain(response) {
        *merged.entry(sample.replica_key()).or_insert(0.0) += sample.value;
    }

    merged
        .into_iter()
        .map(|(key, value)| key.into_sample(round_to(value, precision)))
        .collect()
}
