use crate::bulk::{BulkListener, BulkProcessor, DeliveryStats, CLOSE_TIMEOUT, FLUSH_INTERVAL};
use crate::client::{ClusterClient, OutboundItem};
use crate::connection::OpenFlag;
use crate::error::ClientError;
use std::sync::Arc;
use std::time::Duration;

/// Which strategy a flush limit selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Discard,
    Single,
    Batched,
}

impl DeliveryKind {
    pub fn for_flush_limit(flush_limit: usize) -> Self {
        match flush_limit {
            0 => DeliveryKind::Discard,
            1 => DeliveryKind::Single,
            _ => DeliveryKind::Batched,
        }
    }
}

/// Knobs of batched delivery.
#[derive(Clone)]
pub struct BatchOptions {
    pub flush_interval: Duration,
    pub close_timeout: Duration,
    pub listener: Arc<dyn BulkListener>,
    pub stats: Arc<DeliveryStats>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            flush_interval: FLUSH_INTERVAL,
            close_timeout: CLOSE_TIMEOUT,
            listener: Arc::new(crate::bulk::LoggingListener),
            stats: Arc::new(DeliveryStats::default()),
        }
    }
}

/// How outbound items reach the cluster. Chosen once from the flush limit.
pub enum DeliveryStrategy {
    /// Drop everything; validates configuration and connectivity only.
    Discard,
    /// One request per item, before `send` returns.
    Single {
        client: Option<Arc<dyn ClusterClient>>,
    },
    /// Buffer and ship in bulk.
    Batched {
        flush_limit: usize,
        options: BatchOptions,
        processor: Option<BulkProcessor>,
    },
}

impl DeliveryStrategy {
    pub fn select(flush_limit: usize, options: BatchOptions) -> Self {
        match DeliveryKind::for_flush_limit(flush_limit) {
            DeliveryKind::Discard => DeliveryStrategy::Discard,
            DeliveryKind::Single => DeliveryStrategy::Single { client: None },
            DeliveryKind::Batched => DeliveryStrategy::Batched {
                flush_limit,
                options,
                processor: None,
            },
        }
    }

    pub fn kind(&self) -> DeliveryKind {
        match self {
            DeliveryStrategy::Discard => DeliveryKind::Discard,
            DeliveryStrategy::Single { .. } => DeliveryKind::Single,
            DeliveryStrategy::Batched { .. } => DeliveryKind::Batched,
        }
    }

    /// Bind the strategy to a connected client. Batched delivery starts its
    /// flush timer here.
    pub fn init(&mut self, client: Arc<dyn ClusterClient>, open: OpenFlag) {
        match self {
            DeliveryStrategy::Discard => {}
            DeliveryStrategy::Single { client: slot } => *slot = Some(client),
            DeliveryStrategy::Batched {
                flush_limit,
                options,
                processor,
            } => {
                *processor = Some(BulkProcessor::start(
                    client,
                    *flush_limit,
                    options.flush_interval,
                    Arc::clone(&options.listener),
                    Arc::clone(&options.stats),
                    open,
                ));
            }
        }
    }

    /// Hand one item over. For batched delivery `Ok` only means the item was
    /// buffered.
    pub async fn send(&mut self, item: OutboundItem) -> Result<(), ClientError> {
        match self {
            DeliveryStrategy::Discard => Ok(()),
            DeliveryStrategy::Single { client } => {
                let client = client.as_ref().ok_or(ClientError::NotConnected)?;
                client.index(&item).await
            }
            DeliveryStrategy::Batched { processor, .. } => {
                let processor = processor.as_ref().ok_or(ClientError::NotConnected)?;
                processor.add(item).await;
                Ok(())
            }
        }
    }

    /// Release what `init` acquired. Batched delivery waits a bounded time
    /// for its in-flight flush.
    pub async fn deinit(&mut self) {
        match self {
            DeliveryStrategy::Discard => {}
            DeliveryStrategy::Single { client } => *client = None,
            DeliveryStrategy::Batched {
                options, processor, ..
            } => {
                if let Some(mut processor) = processor.take() {
                    processor.close(options.close_timeout).await;
                }
            }
        }
    }

    pub fn stats(&self) -> Option<Arc<DeliveryStats>> {
        match self {
            DeliveryStrategy::Batched { options, .. } => Some(Arc::clone(&options.stats)),
            _ => None,
        }
    }
}
