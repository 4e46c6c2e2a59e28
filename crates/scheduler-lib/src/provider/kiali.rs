//! Kiali HTTP client for the service-dependency graph

use super::{ServiceGraph, ServiceGraphProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct GraphResponse {
    elements: Elements,
}

#[derive(Debug, Default, Deserialize)]
struct Elements {
    #[serde(default)]
    nodes: Vec<Element<NodeData>>,
    #[serde(default)]
    edges: Vec<Element<EdgeData>>,
}

#[derive(Debug, Deserialize)]
struct Element<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeData {
    id: String,
    node_type: String,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EdgeData {
    source: String,
    target: String,
}

/// A resolved graph vertex
#[derive(Debug, Clone, PartialEq)]
enum Vertex {
    App(String),
    Service(String),
}

impl Vertex {
    fn from_node(node: &NodeData) -> Option<Self> {
        match node.node_type.as_str() {
            "app" => node.app.clone().filter(|a| !a.is_empty()).map(Vertex::App),
            "service" => node
                .service
                .clone()
                .filter(|s| !s.is_empty())
                .map(Vertex::Service),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        match self {
            Vertex::App(name) | Vertex::Service(name) => name,
        }
    }
}

/// Client for the Kiali graph API
pub struct KialiClient {
    client: Client,
    base_url: Url,
    duration: Duration,
}

impl KialiClient {
    /// Create a new client for `base_url`, e.g. `http://kiali:20001/kiali`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("Invalid Kiali URL")?;

        Ok(Self {
            client,
            base_url,
            duration: Duration::from_secs(600),
        })
    }

    /// Traffic window the graph is built over
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    async fn fetch(&self, namespace: &str) -> Result<Elements> {
        let url = self
            .base_url
            .join(&format!("api/namespaces/{namespace}/graph"))
            .context("Invalid graph path")?;

        let response = self
            .client
            .get(url)
            .query(&[
                ("graphType", "app".to_string()),
                ("duration", format!("{}s", self.duration.as_secs())),
            ])
            .send()
            .await
            .context("Failed to send graph request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Kiali error ({}): {}", status, body);
        }

        let graph: GraphResponse = response
            .json()
            .await
            .context("Failed to parse graph response")?;
        Ok(graph.elements)
    }
}

/// Collapse app -> service -> app chains into app pairs
///
/// A service with no downstream app keeps its own name as the target.
fn resolve(elements: &Elements) -> ServiceGraph {
    let vertices: BTreeMap<&str, Vertex> = elements
        .nodes
        .iter()
        .filter_map(|n| Some((n.data.id.as_str(), Vertex::from_node(&n.data)?)))
        .collect();

    let mut downstream: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in &elements.edges {
        downstream
            .entry(edge.data.source.as_str())
            .or_default()
            .push(edge.data.target.as_str());
    }

    let mut graph = ServiceGraph::default();
    for (id, vertex) in &vertices {
        graph.services.insert(vertex.name().to_string());

        let Vertex::App(source) = vertex else {
            continue;
        };
        for target_id in downstream.get(id).into_iter().flatten() {
            match vertices.get(target_id) {
                Some(Vertex::App(target)) => {
                    graph.edges.insert((source.clone(), target.clone()));
                }
                Some(Vertex::Service(service)) => {
                    let apps: BTreeSet<&str> = downstream
                        .get(target_id)
                        .into_iter()
                        .flatten()
                        .filter_map(|id| match vertices.get(id) {
                            Some(Vertex::App(app)) => Some(app.as_str()),
                            _ => None,
                        })
                        .collect();
                    if apps.is_empty() {
                        graph.edges.insert((source.clone(), service.clone()));
                    }
                    for app in apps {
                        graph.edges.insert((source.clone(), app.to_string()));
                    }
                }
                None => {}
            }
        }
    }
    graph
}

#[async_trait]
impl ServiceGraphProvider for KialiClient {
    async fn service_graph(&self, namespace: &str) -> Result<ServiceGraph> {
        let elements = self
            .fetch(namespace)
            .await
            .with_context(|| format!("Failed to read service graph for {namespace}"))?;
        let graph = resolve(&elements);

        debug!(
            namespace = %namespace,
            services = graph.services.len(),
            edges = graph.edges.len(),
            "Resolved service graph"
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const GRAPH_BODY: &str = r#"{
        "elements": {
            "nodes": [
                {"data": {"id": "n0", "nodeType": "app", "app": "frontend"}},
                {"data": {"id": "n1", "nodeType": "service", "service": "cart"}},
                {"data": {"id": "n2", "nodeType": "app", "app": "cart"}},
                {"data": {"id": "n3", "nodeType": "app", "app": "redis"}},
                {"data": {"id": "n4", "nodeType": "service", "service": "payments"}},
                {"data": {"id": "n5", "nodeType": "unknown"}}
            ],
            "edges": [
                {"data": {"source": "n0", "target": "n1"}},
                {"data": {"source": "n1", "target": "n2"}},
                {"data": {"source": "n2", "target": "n3"}},
                {"data": {"source": "n0", "target": "n4"}},
                {"data": {"source": "n5", "target": "n0"}}
            ]
        }
    }"#;

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_resolve_collapses_service_hops() {
        let response: GraphResponse = serde_json::from_str(GRAPH_BODY).unwrap();
        let graph = resolve(&response.elements);

        assert_eq!(
            graph.edges,
            BTreeSet::from([
                pair("cart", "redis"),
                pair("frontend", "cart"),
                pair("frontend", "payments"),
            ])
        );
        assert!(graph.services.contains("payments"));
        assert_eq!(graph.services.len(), 4);
    }

    #[tokio::test]
    async fn test_service_graph_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/kiali/api/namespaces/shop/graph")
            .match_query(Matcher::UrlEncoded("graphType".into(), "app".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(GRAPH_BODY)
            .create_async()
            .await;

        let client = KialiClient::new(&format!("{}/kiali", server.url())).unwrap();
        let graph = client.service_graph("shop").await.unwrap();

        mock.assert_async().await;
        assert_eq!(graph.edges.len(), 3);
    }

    #[tokio::test]
    async fn test_service_graph_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/namespaces/shop/graph")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = KialiClient::new(&server.url()).unwrap();
        assert!(client.service_graph("shop").await.is_err());
    }
}
