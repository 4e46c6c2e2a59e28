//! Error and "no data" outcome types for the placement pipeline

use std::fmt;
use thiserror::Error;

/// Errors raised by the placement pipeline
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModSoftError {
    /// A community distribution violated its sum-to-one invariant
    #[error("invalid community distribution: {0}")]
    InvalidDistribution(String),

    /// Affinity weights were negative or did not sum to one
    #[error("invalid affinity weights: {0}")]
    InvalidWeights(String),

    /// Optimizer settings were out of range
    #[error("invalid optimizer configuration: {0}")]
    InvalidOptimizer(String),

    /// The cluster resource snapshot could not be built
    #[error("cluster resources unavailable for namespace {namespace}")]
    ResourceUnavailable { namespace: String },
}

/// One of the four traffic dimensions combined into an edge affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficDimension {
    BytesExchanged,
    MessageSize,
    TotalMessages,
    Latency,
}

impl TrafficDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficDimension::BytesExchanged => "bytes_exchanged",
            TrafficDimension::MessageSize => "message_size",
            TrafficDimension::TotalMessages => "total_messages",
            TrafficDimension::Latency => "latency",
        }
    }
}

impl fmt::Display for TrafficDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a namespace produced nothing actionable this cycle
///
/// These are expected conditions, not defects. The cycle for the namespace
/// is skipped and retried on the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum NoDataReason {
    /// A traffic query failed at the transport level
    TrafficUnavailable(String),
    /// A traffic dimension returned no samples at all
    NoCommunication(TrafficDimension),
    /// Samples existed but none matched an eligible service pair
    NoEligibleEdges,
    /// The service graph query failed at the transport level
    ServiceGraphUnavailable(String),
    /// The service graph contained no edges
    EmptyServiceGraph,
}

impl NoDataReason {
    /// Short label used for metrics and structured logs
    pub fn label(&self) -> &'static str {
        match self {
            NoDataReason::TrafficUnavailable(_) => "traffic_unavailable",
            NoDataReason::NoCommunication(_) => "no_communication",
            NoDataReason::NoEligibleEdges => "no_eligible_edges",
            NoDataReason::ServiceGraphUnavailable(_) => "service_graph_unavailable",
            NoDataReason::EmptyServiceGraph => "empty_service_graph",
        }
    }
}

impl fmt::Display for NoDataReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoDataReason::TrafficUnavailable(e) => write!(f, "traffic metrics unavailable: {}", e),
            NoDataReason::NoCommunication(dim) => {
                write!(f, "no communication in namespace ({} has no samples)", dim)
            }
            NoDataReason::NoEligibleEdges => {
                write!(f, "no traffic between services eligible in the service graph")
            }
            NoDataReason::ServiceGraphUnavailable(e) => write!(f, "service graph unavailable: {}", e),
            NoDataReason::EmptyServiceGraph => write!(f, "service graph has no edges"),
        }
    }
}
