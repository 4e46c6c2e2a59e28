//! Boundaries to the metrics store and the service-dependency graph
//!
//! The pipeline only talks to these traits; the HTTP clients in the
//! submodules are the production implementations.

mod kiali;
mod promql;

pub use kiali::KialiClient;
pub use promql::{PrometheusClient, TrafficLabels};

use crate::affinity::RawTrafficMetrics;
use crate::models::MetricSample;
use crate::placement::{NodeResourceSamples, PodResourceSamples};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Traffic counters queried per namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficMetric {
    RequestBytesSum,
    ResponseBytesSum,
    RequestBytesCount,
    ResponseBytesCount,
    RequestMessages,
    ResponseMessages,
    TcpConnections,
    Latency,
}

impl TrafficMetric {
    pub const ALL: [TrafficMetric; 8] = [
        TrafficMetric::RequestBytesSum,
        TrafficMetric::ResponseBytesSum,
        TrafficMetric::RequestBytesCount,
        TrafficMetric::ResponseBytesCount,
        TrafficMetric::RequestMessages,
        TrafficMetric::ResponseMessages,
        TrafficMetric::TcpConnections,
        TrafficMetric::Latency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficMetric::RequestBytesSum => "request_bytes_sum",
            TrafficMetric::ResponseBytesSum => "response_bytes_sum",
            TrafficMetric::RequestBytesCount => "request_bytes_count",
            TrafficMetric::ResponseBytesCount => "response_bytes_count",
            TrafficMetric::RequestMessages => "request_messages",
            TrafficMetric::ResponseMessages => "response_messages",
            TrafficMetric::TcpConnections => "tcp_connections",
            TrafficMetric::Latency => "latency",
        }
    }
}

/// Node or pod resource readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMetric {
    CpuAllocatable,
    CpuRequested,
    CpuUsed,
    MemoryAllocatable,
    MemoryRequested,
    MemoryUsed,
}

/// Source of per-replica traffic counters
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Rows for one traffic metric over `window`; an empty result is valid
    async fn traffic(
        &self,
        namespace: &str,
        window: Duration,
        metric: TrafficMetric,
    ) -> Result<Vec<MetricSample>>;
}

/// Source of node capacity and pod footprints
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Allocatable, requested and used resources per node, with zones
    async fn node_resources(&self, window: Duration) -> Result<NodeResourceSamples>;

    /// Requested and used resources per pod in `namespace`
    async fn pod_resources(&self, namespace: &str, window: Duration)
        -> Result<PodResourceSamples>;
}

/// Source of the service-dependency graph
#[async_trait]
pub trait ServiceGraphProvider: Send + Sync {
    async fn service_graph(&self, namespace: &str) -> Result<ServiceGraph>;
}

/// Services of a namespace and the call edges between them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceGraph {
    pub services: BTreeSet<String>,
    pub edges: BTreeSet<(String, String)>,
}

impl ServiceGraph {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// (source, target) pairs traffic may be joined on
    pub fn eligible_pairs(&self) -> BTreeSet<(String, String)> {
        self.edges.clone()
    }
}

/// Fetch every traffic metric for `namespace` concurrently
pub async fn fetch_raw_traffic(
    provider: &dyn MetricsProvider,
    namespace: &str,
    window: Duration,
) -> Result<RawTrafficMetrics> {
    let (
        request_bytes_sum,
        response_bytes_sum,
        request_bytes_count,
        response_bytes_count,
        request_messages,
        response_messages,
        tcp_connections,
        latency,
    ) = tokio::try_join!(
        provider.traffic(namespace, window, TrafficMetric::RequestBytesSum),
        provider.traffic(namespace, window, TrafficMetric::ResponseBytesSum),
        provider.traffic(namespace, window, TrafficMetric::RequestBytesCount),
        provider.traffic(namespace, window, TrafficMetric::ResponseBytesCount),
        provider.traffic(namespace, window, TrafficMetric::RequestMessages),
        provider.traffic(namespace, window, TrafficMetric::ResponseMessages),
        provider.traffic(namespace, window, TrafficMetric::TcpConnections),
        provider.traffic(namespace, window, TrafficMetric::Latency),
    )?;

    Ok(RawTrafficMetrics {
        request_bytes_sum,
        response_bytes_sum,
        request_bytes_count,
        response_bytes_count,
        request_messages,
        response_messages,
        tcp_connections,
        latency,
    })
}

/// Format a window as a PromQL range duration
pub(crate) fn range_selector(window: Duration) -> String {
    format!("{}s", window.as_secs().max(1))
}
