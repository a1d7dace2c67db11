use crate::error::ClientError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Coarse readiness classification reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthTier {
    Red,
    Yellow,
    Green,
}

impl HealthTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTier::Red => "red",
            HealthTier::Yellow => "yellow",
            HealthTier::Green => "green",
        }
    }
}

impl fmt::Display for HealthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthTier {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(HealthTier::Red),
            "yellow" => Ok(HealthTier::Yellow),
            "green" => Ok(HealthTier::Green),
            other => Err(ClientError::Decode(format!("unknown health status '{}'", other))),
        }
    }
}

/// How the client joins the cluster.
///
/// `Transport` talks to the configured server list only; `Node` also
/// discovers the cluster's other nodes when the connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientMode {
    #[default]
    Transport,
    Node,
}

impl ClientMode {
    pub const NAMES: [&'static str; 2] = ["transport", "node"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Transport => "transport",
            ClientMode::Node => "node",
        }
    }
}

impl FromStr for ClientMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transport" => Ok(ClientMode::Transport),
            "node" => Ok(ClientMode::Node),
            other => Err(other.to_string()),
        }
    }
}

/// A fully rendered record, ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundItem {
    /// Index (or topic) the record goes to.
    pub collection: String,
    /// Document type within the collection.
    pub subtype: String,
    /// Document id / message key, when one was configured.
    pub identity: Option<String>,
    /// Serialized body.
    pub payload: String,
}

/// Answer to a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub cluster_name: Option<String>,
    pub status: HealthTier,
    /// The cluster did not reach the requested tier within the timeout.
    pub timed_out: bool,
}

/// Per-item result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub identity: Option<String>,
    pub error: Option<String>,
}

/// Result of a bulk request the backend accepted.
///
/// Individual items may still have failed; see [`BulkResponse::failures`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub took: Duration,
    pub items: Vec<ItemOutcome>,
}

impl BulkResponse {
    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| i.error.is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}

/// Everything a [`ClientFactory`] needs to build a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub servers: Vec<String>,
    pub port: u16,
    pub cluster_name: String,
    pub mode: ClientMode,
    /// Built-in client properties merged over the external properties file.
    pub properties: BTreeMap<String, String>,
}

/// `server` as `host:port`, appending `port` unless one is already given.
pub fn host_port(server: &str, port: u16) -> String {
    let server = server.trim();
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, port)
    }
}

/// Handle to a remote cluster.
///
/// Implementations wrap a concrete client library (Elasticsearch REST, Kafka
/// producer, a test double) and translate its failures into [`ClientError`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Wait until the cluster reports at least `wait_for`, giving up after
    /// `timeout`. A timeout is reported through
    /// [`HealthReport::timed_out`], not as an error.
    async fn health(&self, wait_for: HealthTier, timeout: Duration) -> Result<HealthReport, ClientError>;

    /// Called once the health probe succeeded.
    async fn connected(&self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Deliver a single item.
    async fn index(&self, item: &OutboundItem) -> Result<(), ClientError>;

    /// Deliver a batch of items in one request.
    async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError>;

    /// Release the connection. The client may be opened again afterwards.
    async fn close(&self) {}
}

/// Creates [`ClusterClient`]s for a connection manager.
pub trait ClientFactory: Send + Sync {
    fn create(&self, settings: &ClientSettings) -> Result<Arc<dyn ClusterClient>, ClientError>;

    /// Client properties that always win over the external properties file.
    fn builtin_properties(&self, settings: &ClientSettings) -> BTreeMap<String, String> {
        let _ = settings;
        BTreeMap::new()
    }
}
