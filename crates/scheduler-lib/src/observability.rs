//! Observability for the scheduler
//!
//! Provides:
//! - Prometheus metrics (cycle latency, outcomes, modularity, placements)
//! - Structured cycle events through tracing

use crate::error::NoDataReason;
use crate::pipeline::{CycleOutcome, CycleReport};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<SchedulerMetricsInner> = OnceLock::new();

struct SchedulerMetricsInner {
    cycle_latency_seconds: Histogram,
    cycles_total: IntCounterVec,
    cycle_failures_total: IntCounter,
    modularity: GaugeVec,
    communities: IntGaugeVec,
    placed_replicas: IntGaugeVec,
    unplaced_replicas: IntGaugeVec,
}

impl SchedulerMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "modsoft_cycle_latency_seconds",
                "Time spent on one namespace scheduling cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            cycles_total: register_int_counter_vec!(
                "modsoft_cycles_total",
                "Completed namespace cycles by outcome",
                &["outcome"]
            )
            .expect("Failed to register cycles_total"),

            cycle_failures_total: register_int_counter!(
                "modsoft_cycle_failures_total",
                "Cycles abandoned after a timeout or a task failure"
            )
            .expect("Failed to register cycle_failures_total"),

            modularity: register_gauge_vec!(
                "modsoft_modularity",
                "Soft modularity of the latest community assignment",
                &["namespace"]
            )
            .expect("Failed to register modularity"),

            communities: register_int_gauge_vec!(
                "modsoft_communities",
                "Number of communities in the latest assignment",
                &["namespace"]
            )
            .expect("Failed to register communities"),

            placed_replicas: register_int_gauge_vec!(
                "modsoft_placed_replicas",
                "Replicas placed by the latest plan",
                &["namespace"]
            )
            .expect("Failed to register placed_replicas"),

            unplaced_replicas: register_int_gauge_vec!(
                "modsoft_unplaced_replicas",
                "Replicas the latest plan could not place",
                &["namespace"]
            )
            .expect("Failed to register unplaced_replicas"),
        }
    }
}

/// Handle to the process-wide scheduler metrics
///
/// Clones share the same registered metrics.
#[derive(Clone)]
pub struct SchedulerMetrics {
    _private: (),
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SchedulerMetricsInner {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, elapsed: Duration) {
        self.inner()
            .cycle_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_cycle_failures(&self) {
        self.inner().cycle_failures_total.inc();
    }

    /// Count the outcome and refresh the per-namespace gauges
    pub fn record_outcome(&self, namespace: &str, outcome: &CycleOutcome) {
        let inner = self.inner();
        inner
            .cycles_total
            .with_label_values(&[outcome.label()])
            .inc();

        let Some(report) = outcome.report() else {
            return;
        };
        inner
            .modularity
            .with_label_values(&[namespace])
            .set(report.modularity);
        inner
            .communities
            .with_label_values(&[namespace])
            .set(report.communities.len() as i64);

        let (placed, unplaced) = report
            .plan
            .as_ref()
            .map_or((0, 0), |plan| (plan.placed_count(), plan.unplaced_count()));
        inner
            .placed_replicas
            .with_label_values(&[namespace])
            .set(placed as i64);
        inner
            .unplaced_replicas
            .with_label_values(&[namespace])
            .set(unplaced as i64);
    }
}

/// Structured logger for scheduler events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_cycle_start(&self, namespace: &str) {
        info!(
            event = "cycle_started",
            instance = %self.instance,
            namespace = %namespace,
            "Scheduling cycle started"
        );
    }

    pub fn log_no_data(&self, namespace: &str, reason: &NoDataReason) {
        info!(
            event = "no_data",
            instance = %self.instance,
            namespace = %namespace,
            reason = reason.label(),
            details = %reason,
            "Namespace skipped this cycle"
        );
    }

    pub fn log_communities(&self, report: &CycleReport) {
        info!(
            event = "communities_detected",
            instance = %self.instance,
            namespace = %report.namespace,
            services = report.memberships.len(),
            edges = report.graph.edge_count(),
            communities = report.communities.len(),
            initial_modularity = report.initial_modularity,
            modularity = report.modularity,
            iterations = report.iterations,
            converged = report.converged,
            "Communities detected"
        );
    }

    pub fn log_placement(&self, report: &CycleReport) {
        let Some(plan) = &report.plan else {
            return;
        };
        if plan.unplaced.is_empty() {
            info!(
                event = "placement_completed",
                instance = %self.instance,
                namespace = %report.namespace,
                placed = plan.placed_count(),
                "Placement completed"
            );
        } else {
            warn!(
                event = "placement_completed",
                instance = %self.instance,
                namespace = %report.namespace,
                placed = plan.placed_count(),
                unplaced = plan.unplaced_count(),
                "Placement completed with unplaced replicas"
            );
        }
    }

    pub fn log_resources_unavailable(&self, namespace: &str) {
        warn!(
            event = "resources_unavailable",
            instance = %self.instance,
            namespace = %namespace,
            "No node capacity available, communities reported without placement"
        );
    }

    pub fn log_cycle_failure(&self, namespace: &str, error: &str) {
        warn!(
            event = "cycle_failed",
            instance = %self.instance,
            namespace = %namespace,
            error = %error,
            "Scheduling cycle abandoned"
        );
    }

    /// Emit the events matching one cycle outcome
    pub fn log_outcome(&self, namespace: &str, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Placed(report) => {
                self.log_communities(report);
                self.log_placement(report);
            }
            CycleOutcome::NoData(reason) => self.log_no_data(namespace, reason),
            CycleOutcome::ResourcesUnavailable(report) => {
                self.log_communities(report);
                self.log_resources_unavailable(namespace);
            }
        }
    }

    pub fn log_startup(&self, version: &str, namespaces: &[String]) {
        info!(
            event = "scheduler_started",
            instance = %self.instance,
            version = %version,
            namespaces = ?namespaces,
            "ModSoft scheduler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scheduler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "ModSoft scheduler shutting down"
        );
    }
}
