//! Batched delivery.
//!
//! [`BulkProcessor`] buffers outbound items and ships them in bulk requests
//! when the buffer reaches the flush limit or when the flush interval ticks,
//! whichever comes first. Outcomes are reported to a [`BulkListener`]; failed
//! items are never re-queued.

use crate::client::{BulkResponse, ClusterClient, OutboundItem};
use crate::connection::OpenFlag;
use crate::error::ClientError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn, Instrument};

/// Period of the background flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// How long closing waits for the in-flight flush.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives the outcome of every bulk request.
///
/// Called on the task that performed the flush; implementations must not
/// block.
pub trait BulkListener: Send + Sync {
    fn before_bulk(&self, execution_id: u64, count: usize) {
        let _ = (execution_id, count);
    }

    /// The backend accepted the request. Individual items may still have
    /// failed.
    fn after_bulk(&self, execution_id: u64, count: usize, response: &BulkResponse);

    /// The request as a whole failed.
    fn after_failure(&self, execution_id: u64, count: usize, error: &ClientError);
}

/// Default listener: logs outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl BulkListener for LoggingListener {
    fn before_bulk(&self, execution_id: u64, count: usize) {
        debug!(execution_id, count, "sending bulk request");
    }

    fn after_bulk(&self, execution_id: u64, count: usize, response: &BulkResponse) {
        if !response.has_failures() {
            debug!(execution_id, count, took_ms = response.took.as_millis() as u64, "bulk request succeeded");
            return;
        }
        error!(
            execution_id,
            count,
            failed = response.failed_count(),
            "bulk request partially failed"
        );
        for item in response.failures() {
            error!(
                execution_id,
                identity = item.identity.as_deref().unwrap_or("-"),
                reason = item.error.as_deref().unwrap_or("unknown"),
                "message dropped by cluster"
            );
        }
    }

    fn after_failure(&self, execution_id: u64, count: usize, error: &ClientError) {
        error!(execution_id, count, reason = %error, "bulk request failed, messages dropped");
    }
}

/// Counters of batched delivery, readable by the host at any time.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub batches: AtomicU64,
    pub failed_batches: AtomicU64,
    pub items_acknowledged: AtomicU64,
    pub items_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub failed_batches: u64,
    pub items_acknowledged: u64,
    pub items_failed: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            items_acknowledged: self.items_acknowledged.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    client: Arc<dyn ClusterClient>,
    flush_limit: usize,
    buffer: Mutex<Vec<OutboundItem>>,
    // Held for the whole bulk request: one flush in flight, batches leave in
    // submission order.
    flush_lock: tokio::sync::Mutex<()>,
    listener: Arc<dyn BulkListener>,
    stats: Arc<DeliveryStats>,
    open: OpenFlag,
    next_execution_id: AtomicU64,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, Vec<OutboundItem>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_batch(&self, only_full: bool) -> Vec<OutboundItem> {
        let mut buffer = self.buffer();
        if buffer.is_empty() || (only_full && buffer.len() < self.flush_limit) {
            return Vec::new();
        }
        let n = buffer.len().min(self.flush_limit);
        buffer.drain(..n).collect()
    }

    /// Ship full batches; with `only_full == false` also the remainder.
    async fn flush(&self, only_full: bool) {
        let _in_flight = self.flush_lock.lock().await;
        loop {
            let batch = self.take_batch(only_full);
            if batch.is_empty() {
                break;
            }
            self.execute(batch).await;
        }
    }

    async fn execute(&self, batch: Vec<OutboundItem>) {
        let execution_id = self.next_execution_id.fetch_add(1, Ordering::Relaxed) + 1;
        let count = batch.len();
        self.listener.before_bulk(execution_id, count);

        match self.client.bulk(&batch).await {
            Ok(response) => {
                let failed = (response.failed_count() as u64).min(count as u64);
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .items_acknowledged
                    .fetch_add(count as u64 - failed, Ordering::Relaxed);
                self.stats.items_failed.fetch_add(failed, Ordering::Relaxed);
                self.listener.after_bulk(execution_id, count, &response);
            }
            Err(e) => {
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.items_failed.fetch_add(count as u64, Ordering::Relaxed);
                if e.is_transport() {
                    self.open.mark_broken();
                }
                self.listener.after_failure(execution_id, count, &e);
            }
        }
    }
}

/// Buffers items and ships them in bulk, from the caller when the buffer
/// fills up and from a background task on every interval tick.
pub struct BulkProcessor {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl BulkProcessor {
    /// Must be called from within a Tokio runtime; spawns the flush timer.
    pub fn start(
        client: Arc<dyn ClusterClient>,
        flush_limit: usize,
        flush_interval: Duration,
        listener: Arc<dyn BulkListener>,
        stats: Arc<DeliveryStats>,
        open: OpenFlag,
    ) -> Self {
        let flush_limit = flush_limit.max(1);
        let shared = Arc::new(Shared {
            client,
            flush_limit,
            buffer: Mutex::new(Vec::with_capacity(flush_limit.min(1024))),
            flush_lock: tokio::sync::Mutex::new(()),
            listener,
            stats,
            open,
            next_execution_id: AtomicU64::new(0),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let shared_bg = Arc::clone(&shared);
        let timer = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(flush_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = ticker.tick() => shared_bg.flush(false).await,
                    }
                }
            }
            .in_current_span(),
        );

        BulkProcessor {
            shared,
            shutdown: Some(shutdown_tx),
            timer: Some(timer),
        }
    }

    /// Buffer `item`; flushes inline when the buffer reached the limit.
    pub async fn add(&self, item: OutboundItem) {
        let full = {
            let mut buffer = self.shared.buffer();
            buffer.push(item);
            buffer.len() >= self.shared.flush_limit
        };
        if full {
            self.shared.flush(true).await;
        }
    }

    /// Ship everything buffered and wait until the backend answered.
    pub async fn flush(&self) {
        self.shared.flush(false).await;
    }

    pub fn buffered(&self) -> usize {
        self.shared.buffer().len()
    }

    pub fn flush_limit(&self) -> usize {
        self.shared.flush_limit
    }

    /// Stop the timer and drain the buffer, waiting at most `timeout` for
    /// the in-flight flush. Returns `false` if the wait timed out; whatever
    /// was still buffered is dropped then.
    pub async fn close(&mut self, timeout: Duration) -> bool {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let mut timer = self.timer.take();
        let shared = Arc::clone(&self.shared);

        let drained = tokio::time::timeout(timeout, async {
            if let Some(handle) = timer.as_mut() {
                let _ = handle.await;
            }
            shared.flush(false).await;
        })
        .await;

        if drained.is_err() {
            if let Some(handle) = timer {
                handle.abort();
            }
            let dropped = {
                let mut buffer = self.shared.buffer();
                let n = buffer.len();
                buffer.clear();
                n
            };
            warn!(?timeout, dropped, "timed out waiting for in-flight bulk request");
            return false;
        }
        true
    }
}

impl Drop for BulkProcessor {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingClient;

    #[derive(Default)]
    struct Acks {
        batches: Mutex<Vec<(u64, usize, bool)>>,
    }

    impl BulkListener for Acks {
        fn after_bulk(&self, id: u64, count: usize, _: &BulkResponse) {
            self.batches.lock().unwrap().push((id, count, true));
        }

        fn after_failure(&self, id: u64, count: usize, _: &ClientError) {
            self.batches.lock().unwrap().push((id, count, false));
        }
    }

    fn item(n: usize) -> OutboundItem {
        OutboundItem {
            collection: "logs".into(),
            subtype: "event".into(),
            identity: Some(n.to_string()),
            payload: format!("{{\"n\":{}}}", n),
        }
    }

    fn processor(client: &Arc<RecordingClient>, limit: usize, acks: &Arc<Acks>) -> (BulkProcessor, Arc<DeliveryStats>, OpenFlag) {
        let stats = Arc::new(DeliveryStats::default());
        let open = OpenFlag::default();
        let processor = BulkProcessor::start(
            Arc::clone(client) as Arc<dyn ClusterClient>,
            limit,
            FLUSH_INTERVAL,
            Arc::clone(acks) as Arc<dyn BulkListener>,
            Arc::clone(&stats),
            open.clone(),
        );
        (processor, stats, open)
    }

    #[tokio::test]
    async fn flushes_when_full() {
        let client = Arc::new(RecordingClient::new("logs"));
        let acks = Arc::new(Acks::default());
        let (processor, stats, _) = processor(&client, 5, &acks);

        for n in 0..4 {
            processor.add(item(n)).await;
        }
        assert!(client.bulks().is_empty());
        assert_eq!(processor.buffered(), 4);

        processor.add(item(4)).await;
        assert_eq!(client.bulks().len(), 1);
        assert_eq!(client.bulks()[0], (0..5).map(item).collect::<Vec<_>>());
        assert_eq!(processor.buffered(), 0);
        assert_eq!(*acks.batches.lock().unwrap(), vec![(1, 5, true)]);
        assert_eq!(stats.snapshot().items_acknowledged, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let client = Arc::new(RecordingClient::new("logs"));
        let acks = Arc::new(Acks::default());
        let (processor, _, _) = processor(&client, 100, &acks);

        processor.add(item(1)).await;
        processor.add(item(2)).await;
        assert!(client.bulks().is_empty());

        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(10)).await;
        assert_eq!(client.bulks(), vec![vec![item(1), item(2)]]);
        assert_eq!(processor.buffered(), 0);
    }

    #[tokio::test]
    async fn explicit_flush_and_close() {
        let client = Arc::new(RecordingClient::new("logs"));
        let acks = Arc::new(Acks::default());
        let (mut processor, _, _) = processor(&client, 10, &acks);

        processor.add(item(1)).await;
        processor.flush().await;
        assert_eq!(client.bulks().len(), 1);

        processor.add(item(2)).await;
        assert!(processor.close(CLOSE_TIMEOUT).await);
        assert_eq!(client.bulks().len(), 2);
        assert_eq!(client.bulks()[1], vec![item(2)]);
    }

    #[tokio::test]
    async fn transport_failure_marks_connection_broken() {
        let client = Arc::new(RecordingClient::new("logs"));
        client.set_failing(true);
        let acks = Arc::new(Acks::default());
        let (processor, stats, open) = processor(&client, 2, &acks);
        open.set(true);

        processor.add(item(1)).await;
        processor.add(item(2)).await;

        assert!(!open.is_set());
        assert_eq!(*acks.batches.lock().unwrap(), vec![(1, 2, false)]);
        assert_eq!(stats.snapshot().failed_batches, 1);
        assert_eq!(stats.snapshot().items_failed, 2);
        assert_eq!(processor.buffered(), 0);
    }

    /// Reports one failed outcome more than it was sent.
    struct OverReporting;

    #[async_trait::async_trait]
    impl ClusterClient for OverReporting {
        async fn health(&self, _: crate::client::HealthTier, _: Duration) -> Result<crate::client::HealthReport, ClientError> {
            Err(ClientError::NotConnected)
        }

        async fn index(&self, _: &OutboundItem) -> Result<(), ClientError> {
            Ok(())
        }

        async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
            let failed = crate::client::ItemOutcome {
                identity: None,
                error: Some("rejected".into()),
            };
            Ok(BulkResponse {
                took: Duration::ZERO,
                items: vec![failed; items.len() + 1],
            })
        }
    }

    #[tokio::test]
    async fn excess_failures_are_clamped_to_the_batch() {
        let stats = Arc::new(DeliveryStats::default());
        let processor = BulkProcessor::start(
            Arc::new(OverReporting),
            5,
            FLUSH_INTERVAL,
            Arc::new(LoggingListener),
            Arc::clone(&stats),
            OpenFlag::default(),
        );

        for n in 0..5 {
            processor.add(item(n)).await;
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.items_failed, 5);
        assert_eq!(snapshot.items_acknowledged, 0);
    }

    #[tokio::test]
    async fn rejected_items_are_counted_not_requeued() {
        let client = Arc::new(RecordingClient::new("logs"));
        client.set_reject_items(true);
        let acks = Arc::new(Acks::default());
        let (processor, stats, _) = processor(&client, 3, &acks);

        for n in 0..3 {
            processor.add(item(n)).await;
        }
        processor.flush().await;

        assert_eq!(client.bulks().len(), 1);
        assert_eq!(stats.snapshot().items_failed, 3);
        assert_eq!(stats.snapshot().items_acknowledged, 0);
    }
}
