//! Prometheus HTTP client for Istio traffic and cluster resource metrics

use super::{
    range_selector, MetricsProvider, ResourceMetric, ResourceProvider, TrafficMetric,
};
use crate::models::{MetricSample, ResourceSample};
use crate::placement::{NodeResourceSamples, PodResourceSamples};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Node label carrying the failure zone in `kube_node_labels`
const ZONE_LABEL: &str = "label_topology_kubernetes_io_zone";

/// Pod label naming the owning service in `kube_pod_labels`
const SERVICE_LABEL: &str = "label_app";

/// Label names used to read Istio traffic series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficLabels {
    pub source: String,
    pub target: String,
    pub source_namespace: String,
    pub target_namespace: String,
    pub pod: String,
    pub node: String,
}

impl Default for TrafficLabels {
    fn default() -> Self {
        Self {
            source: "source_app".to_string(),
            target: "destination_app".to_string(),
            source_namespace: "source_workload_namespace".to_string(),
            target_namespace: "destination_workload_namespace".to_string(),
            pod: "pod".to_string(),
            node: "node".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

impl Series {
    fn label(&self, name: &str) -> String {
        self.metric.get(name).cloned().unwrap_or_default()
    }

    fn sample_value(&self) -> Option<f64> {
        self.value.1.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// Client for the Prometheus instant query API
pub struct PrometheusClient {
    client: Client,
    base_url: Url,
    labels: TrafficLabels,
}

impl PrometheusClient {
    /// Create a new client for `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("Invalid Prometheus URL")?;

        Ok(Self {
            client,
            base_url,
            labels: TrafficLabels::default(),
        })
    }

    pub fn with_labels(mut self, labels: TrafficLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Run an instant query and return its vector result
    async fn query(&self, promql: &str) -> Result<Vec<Series>> {
        let url = self
            .base_url
            .join("api/v1/query")
            .context("Invalid query path")?;

        let response = self
            .client
            .get(url)
            .query(&[("query", promql)])
            .send()
            .await
            .context("Failed to send query")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Prometheus error ({}): {}", status, body);
        }

        let body: QueryResponse = response
            .json()
            .await
            .context("Failed to parse query response")?;

        if body.status != "success" {
            anyhow::bail!(
                "Query failed: {}",
                body.error.unwrap_or_else(|| body.status.clone())
            );
        }
        let data = body.data.context("Query response has no data")?;
        if data.result_type != "vector" {
            anyhow::bail!("Unexpected result type: {}", data.result_type);
        }

        debug!(query = %promql, series = data.result.len(), "Prometheus query returned");
        Ok(data.result)
    }

    /// PromQL for one traffic metric in `namespace`
    pub fn traffic_query(&self, namespace: &str, window: Duration, metric: TrafficMetric) -> String {
        let l = &self.labels;
        let name = match metric {
            TrafficMetric::RequestBytesSum => "istio_request_bytes_sum",
            TrafficMetric::ResponseBytesSum => "istio_response_bytes_sum",
            TrafficMetric::RequestBytesCount => "istio_request_bytes_count",
            TrafficMetric::ResponseBytesCount => "istio_response_bytes_count",
            TrafficMetric::RequestMessages => "istio_request_messages_total",
            TrafficMetric::ResponseMessages => "istio_response_messages_total",
            TrafficMetric::TcpConnections => "istio_tcp_connections_opened_total",
            TrafficMetric::Latency => "istio_request_duration_milliseconds_sum",
        };
        format!(
            "sum by ({src}, {dst}, {pod}, {node}) (increase({name}{{reporter=\"source\", {src_ns}=\"{ns}\", {dst_ns}=\"{ns}\"}}[{range}]))",
            src = l.source,
            dst = l.target,
            pod = l.pod,
            node = l.node,
            src_ns = l.source_namespace,
            dst_ns = l.target_namespace,
            ns = namespace,
            range = range_selector(window),
        )
    }

    /// PromQL for one resource metric, per node or per pod of `namespace`
    pub fn resource_query(
        &self,
        namespace: Option<&str>,
        window: Duration,
        metric: ResourceMetric,
    ) -> String {
        let grouping = match namespace {
            Some(_) => "pod, node",
            None => "node",
        };
        let scope = namespace
            .map(|ns| format!(", namespace=\"{ns}\""))
            .unwrap_or_default();
        let range = range_selector(window);

        match metric {
            ResourceMetric::CpuAllocatable => {
                "sum by (node) (kube_node_status_allocatable{resource=\"cpu\"})".to_string()
            }
            ResourceMetric::MemoryAllocatable => {
                "sum by (node) (kube_node_status_allocatable{resource=\"memory\"})".to_string()
            }
            ResourceMetric::CpuRequested => format!(
                "sum by ({grouping}) (kube_pod_container_resource_requests{{resource=\"cpu\"{scope}}})"
            ),
            ResourceMetric::MemoryRequested => format!(
                "sum by ({grouping}) (kube_pod_container_resource_requests{{resource=\"memory\"{scope}}})"
            ),
            ResourceMetric::CpuUsed => format!(
                "sum by ({grouping}) (rate(container_cpu_usage_seconds_total{{container!=\"\"{scope}}}[{range}]))"
            ),
            ResourceMetric::MemoryUsed => format!(
                "sum by ({grouping}) (max_over_time(container_memory_working_set_bytes{{container!=\"\"{scope}}}[{range}]))"
            ),
        }
    }

    async fn node_rows(&self, window: Duration, metric: ResourceMetric) -> Result<Vec<ResourceSample>> {
        let series = self.query(&self.resource_query(None, window, metric)).await?;
        Ok(series
            .iter()
            .filter_map(|s| Some(ResourceSample::node(s.label("node"), s.sample_value()?)))
            .collect())
    }

    async fn pod_rows(
        &self,
        namespace: &str,
        window: Duration,
        metric: ResourceMetric,
    ) -> Result<Vec<ResourceSample>> {
        let series = self
            .query(&self.resource_query(Some(namespace), window, metric))
            .await?;
        Ok(series
            .iter()
            .filter_map(|s| {
                Some(ResourceSample::pod(
                    s.label("node"),
                    s.label("pod"),
                    s.sample_value()?,
                ))
            })
            .collect())
    }

    async fn node_zones(&self) -> Result<BTreeMap<String, String>> {
        let series = self
            .query(&format!("max by (node, {ZONE_LABEL}) (kube_node_labels)"))
            .await?;
        Ok(series
            .iter()
            .filter_map(|s| {
                let zone = s.metric.get(ZONE_LABEL).filter(|z| !z.is_empty())?;
                Some((s.label("node"), zone.clone()))
            })
            .collect())
    }

    /// pod -> service from the pods' `app` label
    async fn pod_services(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let series = self
            .query(&format!(
                "max by (pod, {SERVICE_LABEL}) (kube_pod_labels{{namespace=\"{namespace}\"}})"
            ))
            .await?;
        Ok(series
            .iter()
            .filter_map(|s| {
                let service = s.metric.get(SERVICE_LABEL).filter(|a| !a.is_empty())?;
                Some((s.label("pod"), service.clone()))
            })
            .filter(|(pod, _)| !pod.is_empty())
            .collect())
    }
}

#[async_trait]
impl MetricsProvider for PrometheusClient {
    async fn traffic(
        &self,
        namespace: &str,
        window: Duration,
        metric: TrafficMetric,
    ) -> Result<Vec<MetricSample>> {
        let series = self
            .query(&self.traffic_query(namespace, window, metric))
            .await
            .with_context(|| format!("Failed to query {}", metric.as_str()))?;

        let l = &self.labels;
        Ok(series
            .iter()
            .filter_map(|s| {
                Some(MetricSample::new(
                    s.label(&l.source),
                    s.label(&l.target),
                    s.label(&l.node),
                    s.label(&l.pod),
                    s.sample_value()?,
                ))
            })
            .collect())
    }
}

#[async_trait]
impl ResourceProvider for PrometheusClient {
    async fn node_resources(&self, window: Duration) -> Result<NodeResourceSamples> {
        let (
            cpu_allocatable,
            cpu_requested,
            cpu_used,
            memory_allocatable,
            memory_requested,
            memory_used,
            zones,
        ) = tokio::try_join!(
            self.node_rows(window, ResourceMetric::CpuAllocatable),
            self.node_rows(window, ResourceMetric::CpuRequested),
            self.node_rows(window, ResourceMetric::CpuUsed),
            self.node_rows(window, ResourceMetric::MemoryAllocatable),
            self.node_rows(window, ResourceMetric::MemoryRequested),
            self.node_rows(window, ResourceMetric::MemoryUsed),
            self.node_zones(),
        )
        .context("Failed to query node resources")?;

        Ok(NodeResourceSamples {
            cpu_allocatable,
            cpu_requested,
            cpu_used,
            memory_allocatable,
            memory_requested,
            memory_used,
            zones,
        })
    }

    async fn pod_resources(&self, namespace: &str, window: Duration) -> Result<PodResourceSamples> {
        let (cpu_requested, cpu_used, memory_requested, memory_used, services) = tokio::try_join!(
            self.pod_rows(namespace, window, ResourceMetric::CpuRequested),
            self.pod_rows(namespace, window, ResourceMetric::CpuUsed),
            self.pod_rows(namespace, window, ResourceMetric::MemoryRequested),
            self.pod_rows(namespace, window, ResourceMetric::MemoryUsed),
            self.pod_services(namespace),
        )
        .context("Failed to query pod resources")?;

        Ok(PodResourceSamples {
            cpu_requested,
            cpu_used,
            memory_requested,
            memory_used,
            services,
        })
    }
}
