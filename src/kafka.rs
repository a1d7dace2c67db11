use crate::client::{
    host_port, BulkResponse, ClientFactory, ClientSettings, ClusterClient, HealthReport,
    HealthTier, ItemOutcome, OutboundItem,
};
use crate::error::ClientError;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a single record may wait in the producer queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Publishes outbound items to Kafka: the collection names the topic, the
/// identity is the message key and the payload is the message body.
#[derive(Clone)]
pub struct KafkaClient {
    producer: FutureProducer,
}

fn broker_error(e: KafkaError) -> ClientError {
    ClientError::Broker(e.to_string())
}

impl KafkaClient {
    /// Build a producer from the merged client properties.
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let mut config = ClientConfig::new();
        for (key, value) in &settings.properties {
            config.set(key, value);
        }
        let producer: FutureProducer = config.create().map_err(broker_error)?;
        Ok(KafkaClient { producer })
    }

    fn record<'a>(item: &'a OutboundItem) -> FutureRecord<'a, str, str> {
        let record = FutureRecord::to(&item.collection).payload(item.payload.as_str());
        match &item.identity {
            Some(key) => record.key(key.as_str()),
            None => record,
        }
    }
}

#[async_trait]
impl ClusterClient for KafkaClient {
    /// Kafka has no health tiers: a broker answering a metadata request in
    /// time counts as green.
    async fn health(&self, _wait_for: HealthTier, timeout: Duration) -> Result<HealthReport, ClientError> {
        let producer = self.producer.clone();
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| ClientError::Broker(e.to_string()))?;

        Ok(match brokers {
            Ok(brokers) => {
                debug!(brokers, "fetched kafka metadata");
                HealthReport {
                    cluster_name: None,
                    status: HealthTier::Green,
                    timed_out: false,
                }
            }
            Err(e) => {
                debug!(reason = %e, "kafka metadata request failed");
                HealthReport {
                    cluster_name: None,
                    status: HealthTier::Red,
                    timed_out: true,
                }
            }
        })
    }

    async fn index(&self, item: &OutboundItem) -> Result<(), ClientError> {
        self.producer
            .send(Self::record(item), SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| broker_error(e))?;
        Ok(())
    }

    async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
        let started = Instant::now();

        // Enqueue everything first, then collect the delivery reports.
        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            pending.push(
                self.producer
                    .send_result(Self::record(item))
                    .map_err(|(e, _)| e.to_string()),
            );
        }

        let mut outcomes = Vec::with_capacity(items.len());
        for (item, delivery) in items.iter().zip(pending) {
            let error = match delivery {
                Ok(future) => match future.await {
                    Ok(Ok(_)) => None,
                    Ok(Err((e, _))) => Some(e.to_string()),
                    Err(_) => Some("delivery canceled".to_string()),
                },
                Err(e) => Some(e),
            };
            outcomes.push(ItemOutcome {
                identity: item.identity.clone(),
                error,
            });
        }

        Ok(BulkResponse {
            took: started.elapsed(),
            items: outcomes,
        })
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(CLOSE_FLUSH_TIMEOUT)).await;
        if let Ok(Err(e)) = flushed {
            debug!(reason = %e, "kafka producer flush on close failed");
        }
    }
}

/// Builds [`KafkaClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaFactory;

impl ClientFactory for KafkaFactory {
    fn create(&self, settings: &ClientSettings) -> Result<Arc<dyn ClusterClient>, ClientError> {
        Ok(Arc::new(KafkaClient::new(settings)?))
    }

    fn builtin_properties(&self, settings: &ClientSettings) -> BTreeMap<String, String> {
        let brokers = settings
            .servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| host_port(s, settings.port))
            .collect::<Vec<_>>()
            .join(",");
        BTreeMap::from([("bootstrap.servers".to_string(), brokers)])
    }
}
