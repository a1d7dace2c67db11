//! Elasticsearch REST client.

use crate::client::{
    host_port, BulkResponse, ClientFactory, ClientMode, ClientSettings, ClusterClient, HealthReport,
    HealthTier, ItemOutcome, OutboundItem,
};
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, warn};

pub const SCHEME_PROPERTY: &str = "scheme";
pub const USERNAME_PROPERTY: &str = "username";
pub const PASSWORD_PROPERTY: &str = "password";
/// Upper bound of one request in milliseconds, connecting included.
pub const REQUEST_TIMEOUT_PROPERTY: &str = "request.timeout.ms";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to an Elasticsearch cluster over HTTP, rotating requests over the
/// known nodes.
#[derive(Debug)]
pub struct ElasticsearchClient {
    http: Client,
    scheme: String,
    credentials: Option<(String, Option<String>)>,
    mode: ClientMode,
    nodes: RwLock<Vec<String>>,
    next: AtomicUsize,
}

#[derive(Deserialize)]
struct HealthBody {
    cluster_name: Option<String>,
    status: String,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Deserialize)]
struct BulkBody {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct NodesBody {
    #[serde(default)]
    nodes: HashMap<String, NodeInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    http: Option<NodeHttp>,
}

#[derive(Deserialize)]
struct NodeHttp {
    publish_address: String,
}

/// Base URL of one node. Servers already carrying a scheme or a port are
/// taken as given.
pub fn node_url(scheme: &str, server: &str, port: u16) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.contains("://") {
        server.to_string()
    } else {
        format!("{}://{}", scheme, host_port(server, port))
    }
}

impl ElasticsearchClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let scheme = settings
            .properties
            .get(SCHEME_PROPERTY)
            .map(String::as_str)
            .unwrap_or("http")
            .to_string();
        let nodes: Vec<String> = settings
            .servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| node_url(&scheme, s, settings.port))
            .collect();
        if nodes.is_empty() {
            return Err(ClientError::NoNodes);
        }

        let credentials = settings.properties.get(USERNAME_PROPERTY).map(|user| {
            (user.clone(), settings.properties.get(PASSWORD_PROPERTY).cloned())
        });
        let request_timeout = match settings.properties.get(REQUEST_TIMEOUT_PROPERTY) {
            Some(ms) => ms.trim().parse().map(Duration::from_millis).unwrap_or_else(|_| {
                warn!(value = %ms, "invalid {}, using the default", REQUEST_TIMEOUT_PROPERTY);
                REQUEST_TIMEOUT
            }),
            None => REQUEST_TIMEOUT,
        };
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()?;

        Ok(ElasticsearchClient {
            http,
            scheme,
            credentials,
            mode: settings.mode,
            nodes: RwLock::new(nodes),
            next: AtomicUsize::new(0),
        })
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn nodes(&self) -> Vec<String> {
        self.read_nodes().clone()
    }

    fn request(&self, method: Method, node: &str, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", node, path));
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }

    /// Send to the next node, moving on to the following ones while the
    /// transport fails.
    async fn execute<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(ClientError::NoNodes);
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        let mut last = ClientError::NoNodes;
        for offset in 0..nodes.len() {
            let node = &nodes[(start + offset) % nodes.len()];
            match build(node).send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(node = %node, reason = %e, "request failed, trying next node");
                    last = e.into();
                }
            }
        }
        Err(last)
    }

    async fn expect_success(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn discover_nodes(&self) -> Result<(), ClientError> {
        let response = self
            .execute(|node| self.request(Method::GET, node, "/_nodes/http"))
            .await?;
        let body: NodesBody = Self::expect_success(response).await?.json().await?;

        let mut discovered: Vec<String> = body
            .nodes
            .values()
            .filter_map(|n| n.http.as_ref())
            .map(|h| publish_url(&self.scheme, &h.publish_address))
            .collect();
        if discovered.is_empty() {
            warn!("node discovery returned no HTTP nodes, keeping configured servers");
            return Ok(());
        }
        discovered.sort();
        discovered.dedup();
        debug!(nodes = ?discovered, "discovered cluster nodes");

        *self.nodes.write().unwrap_or_else(|e| e.into_inner()) = discovered;
        Ok(())
    }
}

// Publish addresses look like "10.0.0.1:9200" or "host/10.0.0.1:9200".
fn publish_url(scheme: &str, address: &str) -> String {
    let address = address.rsplit('/').next().unwrap_or(address);
    format!("{}://{}", scheme, address)
}

fn document_path(item: &OutboundItem) -> (Method, String) {
    let index = urlencoding::encode(&item.collection);
    let subtype = urlencoding::encode(&item.subtype);
    match &item.identity {
        Some(id) => (
            Method::PUT,
            format!("/{}/{}/{}", index, subtype, urlencoding::encode(id)),
        ),
        None => (Method::POST, format!("/{}/{}", index, subtype)),
    }
}

fn bulk_body(items: &[OutboundItem]) -> String {
    let mut body = String::new();
    for item in items {
        let mut action = json!({ "_index": item.collection, "_type": item.subtype });
        if let Some(id) = &item.identity {
            action["_id"] = json!(id);
        }
        body.push_str(&json!({ "index": action }).to_string());
        body.push('\n');
        body.push_str(item.payload.trim_end_matches('\n'));
        body.push('\n');
    }
    body
}

fn item_error(error: &Value) -> String {
    error
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[async_trait]
impl ClusterClient for ElasticsearchClient {
    async fn health(&self, wait_for: HealthTier, timeout: Duration) -> Result<HealthReport, ClientError> {
        let path = format!(
            "/_cluster/health?wait_for_status={}&timeout={}s",
            wait_for,
            timeout.as_secs().max(1)
        );
        let response = self
            .execute(|node| {
                self.request(Method::GET, node, &path)
                    .timeout(timeout + CONNECT_TIMEOUT)
            })
            .await?;

        // A wait that ran out answers 408 with the regular health body.
        let response = if response.status() == StatusCode::REQUEST_TIMEOUT {
            response
        } else {
            Self::expect_success(response).await?
        };
        let body: HealthBody = response.json().await?;

        Ok(HealthReport {
            cluster_name: body.cluster_name,
            status: body.status.parse()?,
            timed_out: body.timed_out,
        })
    }

    async fn connected(&self) -> Result<(), ClientError> {
        if self.mode == ClientMode::Node {
            self.discover_nodes().await?;
        }
        Ok(())
    }

    async fn index(&self, item: &OutboundItem) -> Result<(), ClientError> {
        let (method, path) = document_path(item);
        let response = self
            .execute(|node| {
                self.request(method.clone(), node, &path)
                    .header("Content-Type", "application/json")
                    .body(item.payload.clone())
            })
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
        let body = bulk_body(items);
        let response = self
            .execute(|node| {
                self.request(Method::POST, node, "/_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;
        let parsed: BulkBody = Self::expect_success(response).await?.json().await?;

        // Outcomes beyond the request's own items are ignored.
        let outcomes = parsed
            .items
            .into_iter()
            .take(items.len())
            .enumerate()
            .map(|(n, action)| {
                let result = action.into_values().next();
                let identity = items
                    .get(n)
                    .and_then(|i| i.identity.clone())
                    .or_else(|| result.as_ref().and_then(|r| r.id.clone()));
                ItemOutcome {
                    identity,
                    error: result.and_then(|r| r.error).map(|e| item_error(&e)),
                }
            })
            .collect();

        Ok(BulkResponse {
            took: Duration::from_millis(parsed.took),
            items: outcomes,
        })
    }
}

/// Builds [`ElasticsearchClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElasticsearchFactory;

impl ClientFactory for ElasticsearchFactory {
    fn create(&self, settings: &ClientSettings) -> Result<std::sync::Arc<dyn ClusterClient>, ClientError> {
        Ok(std::sync::Arc::new(ElasticsearchClient::new(settings)?))
    }

    fn builtin_properties(&self, settings: &ClientSettings) -> BTreeMap<String, String> {
        BTreeMap::from([("cluster.name".to_string(), settings.cluster_name.clone())])
    }
}
