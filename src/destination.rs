use crate::bulk::DeliveryStats;
use crate::client::{ClientFactory, ClientMode, ClientSettings};
use crate::connection::{ConnectionManager, HealthProbe};
use crate::delivery::{BatchOptions, DeliveryKind, DeliveryStrategy};
use crate::env::OptionSource;
use crate::options::{DestinationOptions, ResolvedOptions};
use crate::properties;
use crate::record::LogRecord;
use crate::template::TemplateEngine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn, Instrument, Span};

/// Lifecycle position of a [`Destination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Created,
    Initialized,
    Opened,
    Closed,
    Deinitialized,
}

/// Log destination driven by the host pipeline.
///
/// The host calls [`init`](Self::init) once, [`open`](Self::open) until it
/// succeeds, [`send`](Self::send) per record while
/// [`is_opened`](Self::is_opened), [`close`](Self::close) when a send fails
/// or on shutdown, and finally [`deinit`](Self::deinit). None of these
/// methods return errors: failures are logged and reported as `false`.
pub struct Destination {
    options: DestinationOptions,
    engine: Arc<dyn TemplateEngine>,
    factory: Arc<dyn ClientFactory>,
    probe: HealthProbe,
    batch: BatchOptions,
    span: Span,
    state: DestinationState,
    resolved: Option<ResolvedOptions>,
    connection: Option<ConnectionManager>,
    strategy: Option<DeliveryStrategy>,
    opened: bool,
}

impl Destination {
    /// Create a destination whose options read their raw values from
    /// `source`. Nothing is validated until [`init`](Self::init).
    pub fn new(
        source: &dyn OptionSource,
        engine: Arc<dyn TemplateEngine>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Destination {
            options: DestinationOptions::from_source(source),
            engine,
            factory,
            probe: HealthProbe::default(),
            batch: BatchOptions::default(),
            span: tracing::info_span!("destination"),
            state: DestinationState::Created,
            resolved: None,
            connection: None,
            strategy: None,
            opened: false,
        }
    }

    /// Span all of the destination's log output is recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_health_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_batch_options(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }

    pub fn state(&self) -> DestinationState {
        self.state
    }

    pub fn resolved_options(&self) -> Option<&ResolvedOptions> {
        self.resolved.as_ref()
    }

    pub fn delivery_kind(&self) -> Option<DeliveryKind> {
        self.strategy.as_ref().map(DeliveryStrategy::kind)
    }

    /// Counters of batched delivery; `None` for the other strategies.
    pub fn stats(&self) -> Option<Arc<DeliveryStats>> {
        self.strategy.as_ref().and_then(DeliveryStrategy::stats)
    }

    /// Validate every option and prepare the client. `false` means the
    /// configuration is unusable and the host must not call `open`.
    pub fn init(&mut self) -> bool {
        let span = self.span.clone();
        let _enter = span.enter();

        let resolved = match self.options.init(self.engine.as_ref()) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(option = e.option_name(), error = %e, "invalid destination configuration");
                return false;
            }
        };

        let mut settings = ClientSettings {
            servers: resolved.servers.clone(),
            port: resolved.port,
            cluster_name: resolved.cluster_name.clone(),
            mode: resolved.client_mode,
            properties: BTreeMap::new(),
        };
        let builtin = self.factory.builtin_properties(&settings);
        settings.properties =
            properties::merge_with_file(builtin, resolved.properties_file.as_deref());

        let mut connection =
            ConnectionManager::new(Arc::clone(&self.factory), settings, self.probe);
        if let Err(e) = connection.init() {
            error!(reason = %e, "failed to create cluster client");
            return false;
        }

        if resolved.flush_limit == 0 {
            warn!("flush-limit is 0: only the client side is exercised, no messages are sent to the cluster");
        }
        if resolved.client_mode == ClientMode::Transport && resolved.flush_limit > 1 {
            warn!(
                flush_limit = resolved.flush_limit,
                "bulk delivery over a transport client can drop many messages when the connection breaks; node client mode is suggested"
            );
        }

        self.strategy = Some(DeliveryStrategy::select(resolved.flush_limit, self.batch.clone()));
        self.connection = Some(connection);
        self.resolved = Some(resolved);
        self.state = DestinationState::Initialized;
        true
    }

    /// Connect and wait for the cluster to become healthy.
    pub async fn open(&mut self) -> bool {
        let span = self.span.clone();
        self.open_inner().instrument(span).await
    }

    async fn open_inner(&mut self) -> bool {
        if self.opened {
            if self.connection_is_open() {
                return true;
            }
            self.close_inner().await;
        }

        let (Some(connection), Some(strategy)) = (self.connection.as_mut(), self.strategy.as_mut())
        else {
            error!("destination opened before a successful init");
            return false;
        };

        if !connection.open().await {
            return false;
        }
        let Some(client) = connection.client() else {
            return false;
        };

        strategy.init(client, connection.open_flag());
        self.opened = true;
        self.state = DestinationState::Opened;
        true
    }

    fn connection_is_open(&self) -> bool {
        self.connection.as_ref().map_or(false, ConnectionManager::is_open)
    }

    pub fn is_opened(&self) -> bool {
        self.opened && self.connection_is_open()
    }

    /// Render `record` and hand it to the delivery strategy. `true` means
    /// accepted (sent for single delivery, buffered for batched delivery).
    pub async fn send(&mut self, record: &LogRecord) -> bool {
        let span = self.span.clone();
        self.send_inner(record).instrument(span).await
    }

    async fn send_inner(&mut self, record: &LogRecord) -> bool {
        if !self.connection_is_open() {
            self.close_inner().await;
            return false;
        }
        let (Some(resolved), Some(strategy)) = (self.resolved.as_ref(), self.strategy.as_mut()) else {
            return false;
        };

        let item = resolved.renderer.render(record);
        debug!(index = %item.collection, json = %item.payload, "outgoing log entry");

        let sent = strategy.send(item).await;
        match sent {
            Ok(()) => true,
            Err(e) => {
                error!(reason = %e, "failed to send message");
                self.close_inner().await;
                false
            }
        }
    }

    /// Flush, stop delivery and release the connection. Does nothing when
    /// not open. A stuck backend delays this by at most the batch close
    /// timeout.
    pub async fn close(&mut self) {
        let span = self.span.clone();
        self.close_inner().instrument(span).await
    }

    async fn close_inner(&mut self) {
        if !self.opened {
            return;
        }
        // Drains the batch buffer with a bounded wait.
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.deinit().await;
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.close().await;
        }
        self.opened = false;
        self.state = DestinationState::Closed;
    }

    /// Release the client and the options. Safe after a failed `init` and
    /// safe to repeat.
    pub fn deinit(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        if let Some(mut connection) = self.connection.take() {
            connection.deinit();
        }
        self.strategy = None;
        self.resolved = None;
        self.options.deinit();
        self.opened = false;
        self.state = DestinationState::Deinitialized;
    }
}
