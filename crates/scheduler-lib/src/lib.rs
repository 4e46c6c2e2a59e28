//! Affinity-driven microservice placement
//!
//! This crate provides the core functionality for:
//! - Building a traffic-affinity graph from per-replica service metrics
//! - Soft-modularity community detection over that graph
//! - Resource-aware packing of communities onto nodes
//! - Provider seams for the metrics store and service graph
//! - Health checks and observability

pub mod affinity;
pub mod community;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod placement;
pub mod provider;

pub use error::{ModSoftError, NoDataReason, TrafficDimension};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SchedulerMetrics, StructuredLogger};
pub use pipeline::{CycleOutcome, CycleReport, Pipeline, PipelineBuilder, PipelineConfig};
