use crate::client::{ClientFactory, ClientSettings, ClusterClient, HealthTier};
use crate::error::ClientError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Timeout of each health probe stage.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time granted to the transport on top of the server-side probe
/// timeout before the probe is abandoned locally.
const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Two-stage readiness probe: wait for `preferred`, and if that times out,
/// wait for `fallback` with the same timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbe {
    pub timeout: Duration,
    pub preferred: HealthTier,
    pub fallback: HealthTier,
}

impl Default for HealthProbe {
    fn default() -> Self {
        HealthProbe {
            timeout: HEALTH_TIMEOUT,
            preferred: HealthTier::Green,
            fallback: HealthTier::Yellow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initialized,
    Connected,
    Closed,
}

/// Shared "connection is usable" flag.
///
/// Set by a successful [`ConnectionManager::open`]; cleared by `close` or by
/// the delivery path when it sees a transport failure, which makes the next
/// send close the destination so the host re-opens it.
#[derive(Debug, Clone, Default)]
pub struct OpenFlag(Arc<AtomicBool>);

impl OpenFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    pub fn mark_broken(&self) {
        self.set(false);
    }
}

/// Owns the cluster client of one destination and gates its use on cluster
/// health.
pub struct ConnectionManager {
    factory: Arc<dyn ClientFactory>,
    settings: ClientSettings,
    probe: HealthProbe,
    client: Option<Arc<dyn ClusterClient>>,
    state: ConnectionState,
    opened: OpenFlag,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ClientFactory>, settings: ClientSettings, probe: HealthProbe) -> Self {
        ConnectionManager {
            factory,
            settings,
            probe,
            client: None,
            state: ConnectionState::Uninitialized,
            opened: OpenFlag::default(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Create the client.
    pub fn init(&mut self) -> Result<(), ClientError> {
        self.client = Some(self.factory.create(&self.settings)?);
        self.state = ConnectionState::Initialized;
        Ok(())
    }

    /// Create the client if needed and wait for the cluster to become
    /// healthy. Never fails loudly: every problem is logged and reported as
    /// `false`, and the client stays allocated for the next attempt.
    pub async fn open(&mut self) -> bool {
        let client = match &self.client {
            Some(client) => Arc::clone(client),
            None => match self.factory.create(&self.settings) {
                Ok(client) => {
                    self.client = Some(Arc::clone(&client));
                    client
                }
                Err(e) => {
                    error!(cluster = %self.settings.cluster_name, reason = %e, "failed to create cluster client");
                    self.opened.set(false);
                    return false;
                }
            },
        };

        info!(cluster = %self.settings.cluster_name, "connecting to cluster");
        match self.connect(client.as_ref()).await {
            Ok(tier) => {
                info!(cluster = %self.settings.cluster_name, status = %tier, "connected to cluster");
                self.state = ConnectionState::Connected;
                self.opened.set(true);
                true
            }
            Err(e) => {
                error!(cluster = %self.settings.cluster_name, reason = %e, "failed to connect to cluster");
                self.opened.set(false);
                false
            }
        }
    }

    async fn connect(&self, client: &dyn ClusterClient) -> Result<HealthTier, ClientError> {
        let tier = if self.wait_for(client, self.probe.preferred).await? {
            self.probe.preferred
        } else {
            debug!(
                status = %self.probe.preferred,
                fallback = %self.probe.fallback,
                "timed out waiting for cluster status, trying fallback"
            );
            if !self.wait_for(client, self.probe.fallback).await? {
                debug!(status = %self.probe.fallback, "timed out");
                return Err(ClientError::Unhealthy {
                    cluster: self.settings.cluster_name.clone(),
                });
            }
            self.probe.fallback
        };

        client.connected().await?;
        Ok(tier)
    }

    async fn wait_for(&self, client: &dyn ClusterClient, tier: HealthTier) -> Result<bool, ClientError> {
        let probe = client.health(tier, self.probe.timeout);
        let report = match tokio::time::timeout(self.probe.timeout + PROBE_GRACE, probe).await {
            Ok(report) => report?,
            Err(_) => return Ok(false),
        };

        if let Some(actual) = &report.cluster_name {
            if actual != &self.settings.cluster_name {
                return Err(ClientError::ClusterMismatch {
                    expected: self.settings.cluster_name.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(!report.timed_out && report.status >= tier)
    }

    /// Result of the last [`open`](Self::open), unless a close or a transport
    /// failure cleared it since.
    pub fn is_open(&self) -> bool {
        self.opened.is_set()
    }

    pub fn open_flag(&self) -> OpenFlag {
        self.opened.clone()
    }

    pub fn client(&self) -> Option<Arc<dyn ClusterClient>> {
        self.client.clone()
    }

    /// Release the connection but keep the client object for a later open.
    pub async fn close(&mut self) {
        if let Some(client) = &self.client {
            client.close().await;
        }
        self.opened.set(false);
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Closed;
        }
    }

    /// Drop the client.
    pub fn deinit(&mut self) {
        self.client = None;
        self.opened.set(false);
        self.state = ConnectionState::Uninitialized;
    }
}
