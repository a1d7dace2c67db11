use crate::client::{
    BulkResponse, ClientFactory, ClientSettings, ClusterClient, HealthReport, HealthTier,
    ItemOutcome, OutboundItem,
};
use crate::error::ClientError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// In-memory cluster that records every request instead of sending it.
///
/// Useful for dry runs and for tests: the reported health tier, transport
/// failures and per-item rejections can all be scripted.
#[derive(Debug)]
pub struct RecordingClient {
    cluster_name: String,
    state: Mutex<RecordingState>,
}

#[derive(Debug)]
struct RecordingState {
    tier: HealthTier,
    unreachable: bool,
    failing: bool,
    reject_items: bool,
    health_requests: Vec<HealthTier>,
    indexed: Vec<OutboundItem>,
    bulks: Vec<Vec<OutboundItem>>,
    connected: usize,
    closed: usize,
}

impl RecordingClient {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        RecordingClient {
            cluster_name: cluster_name.into(),
            state: Mutex::new(RecordingState {
                tier: HealthTier::Green,
                unreachable: false,
                failing: false,
                reject_items: false,
                health_requests: Vec::new(),
                indexed: Vec::new(),
                bulks: Vec::new(),
                connected: 0,
                closed: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Health tier the simulated cluster reports.
    pub fn set_tier(&self, tier: HealthTier) {
        self.state().tier = tier;
    }

    /// Make health probes fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Make index and bulk requests fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Accept bulk requests but reject every item in them.
    pub fn set_reject_items(&self, reject: bool) {
        self.state().reject_items = reject;
    }

    pub fn health_requests(&self) -> Vec<HealthTier> {
        self.state().health_requests.clone()
    }

    pub fn indexed(&self) -> Vec<OutboundItem> {
        self.state().indexed.clone()
    }

    pub fn bulks(&self) -> Vec<Vec<OutboundItem>> {
        self.state().bulks.clone()
    }

    /// Index plus bulk requests received so far.
    pub fn request_count(&self) -> usize {
        let state = self.state();
        state.indexed.len() + state.bulks.len()
    }

    pub fn connected_count(&self) -> usize {
        self.state().connected
    }

    pub fn close_count(&self) -> usize {
        self.state().closed
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn health(&self, wait_for: HealthTier, _timeout: Duration) -> Result<HealthReport, ClientError> {
        let mut state = self.state();
        state.health_requests.push(wait_for);
        if state.unreachable {
            return Err(ClientError::Transport("connection refused".into()));
        }
        Ok(HealthReport {
            cluster_name: Some(self.cluster_name.clone()),
            status: state.tier,
            timed_out: state.tier < wait_for,
        })
    }

    async fn connected(&self) -> Result<(), ClientError> {
        self.state().connected += 1;
        Ok(())
    }

    async fn index(&self, item: &OutboundItem) -> Result<(), ClientError> {
        let mut state = self.state();
        if state.failing {
            return Err(ClientError::Transport("connection reset".into()));
        }
        state.indexed.push(item.clone());
        Ok(())
    }

    async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
        let mut state = self.state();
        if state.failing {
            return Err(ClientError::Transport("connection reset".into()));
        }
        state.bulks.push(items.to_vec());
        let error = state.reject_items.then(|| "rejected".to_string());
        Ok(BulkResponse {
            took: Duration::ZERO,
            items: items
                .iter()
                .map(|item| ItemOutcome {
                    identity: item.identity.clone(),
                    error: error.clone(),
                })
                .collect(),
        })
    }

    async fn close(&self) {
        self.state().closed += 1;
    }
}

/// Factory handing out one shared [`RecordingClient`].
#[derive(Debug, Clone)]
pub struct RecordingFactory {
    client: Arc<RecordingClient>,
    created: Arc<AtomicUsize>,
}

impl RecordingFactory {
    pub fn new(client: Arc<RecordingClient>) -> Self {
        RecordingFactory {
            client,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client(&self) -> Arc<RecordingClient> {
        Arc::clone(&self.client)
    }

    /// Number of times a client was requested.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl ClientFactory for RecordingFactory {
    fn create(&self, _settings: &ClientSettings) -> Result<Arc<dyn ClusterClient>, ClientError> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.client) as Arc<dyn ClusterClient>)
    }
}
