use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_log_sink::bulk::{CLOSE_TIMEOUT, FLUSH_INTERVAL};
use cluster_log_sink::client::{BulkResponse, ClientSettings, HealthReport, ItemOutcome};
use cluster_log_sink::error::ClientError;
use cluster_log_sink::connection::HealthProbe;
use cluster_log_sink::delivery::{BatchOptions, DeliveryKind};
use cluster_log_sink::options::{
    CLIENT_MODE, CLUSTER_NAME, FLUSH_LIMIT, IDENTITY_TEMPLATE, INDEX_TEMPLATE,
    MESSAGE_BODY_TEMPLATE, PORT, TYPE_TEMPLATE,
};
use cluster_log_sink::recording::{RecordingClient, RecordingFactory};
use cluster_log_sink::{
    ClientFactory, ClusterClient, Destination, DestinationState, HealthTier, LogRecord,
    MacroEngine, OutboundItem,
};

fn options(extra: &[(&str, &str)]) -> HashMap<String, String> {
    let mut options: HashMap<String, String> = [
        (CLUSTER_NAME, "logs"),
        (INDEX_TEMPLATE, "syslog-$(app)"),
        (TYPE_TEMPLATE, "event"),
        (MESSAGE_BODY_TEMPLATE, "$(field)"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        options.insert(k.to_string(), v.to_string());
    }
    options
}

fn destination(extra: &[(&str, &str)]) -> (Destination, Arc<RecordingClient>, RecordingFactory) {
    let client = Arc::new(RecordingClient::new("logs"));
    let factory = RecordingFactory::new(Arc::clone(&client));
    let destination = Destination::new(
        &options(extra),
        Arc::new(MacroEngine),
        Arc::new(factory.clone()),
    );
    (destination, client, factory)
}

fn record(n: usize) -> LogRecord {
    LogRecord::new("INFO", format!("message {}", n))
        .with_field("app", "billing")
        .with_field("field", "x")
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Run `init` and return its result with everything it logged.
fn init_logged(destination: &mut Destination) -> (bool, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let ok = tracing::subscriber::with_default(subscriber, || destination.init());
    (ok, captured.text())
}

#[tokio::test]
async fn flush_limit_zero_never_touches_the_cluster() {
    let (mut destination, client, _) = destination(&[(FLUSH_LIMIT, "0")]);
    assert!(destination.init());
    assert_eq!(destination.delivery_kind(), Some(DeliveryKind::Discard));
    assert!(destination.open().await);

    for n in 0..100 {
        assert!(destination.send(&record(n)).await);
    }
    destination.close().await;
    assert_eq!(client.request_count(), 0);
}

#[tokio::test]
async fn flush_limit_one_sends_each_record_before_returning() {
    let (mut destination, client, _) = destination(&[]);
    assert!(destination.init());
    assert!(destination.open().await);

    assert!(destination.send(&record(1)).await);
    let indexed = client.indexed();
    assert_eq!(indexed.len(), 1);
    assert_eq!(indexed[0].collection, "syslog-billing");
    assert_eq!(indexed[0].subtype, "event");
    assert_eq!(indexed[0].payload, "x");
    assert_eq!(indexed[0].identity, None);

    assert!(destination.send(&record(2)).await);
    assert_eq!(client.request_count(), 2);
}

#[tokio::test]
async fn flush_limit_five_flushes_once_after_five_sends() {
    let (mut destination, client, _) = destination(&[(FLUSH_LIMIT, "5")]);
    assert!(destination.init());
    assert!(destination.open().await);

    for n in 0..4 {
        assert!(destination.send(&record(n)).await);
    }
    assert!(client.bulks().is_empty());

    assert!(destination.send(&record(4)).await);
    let bulks = client.bulks();
    assert_eq!(bulks.len(), 1);
    assert_eq!(bulks[0].len(), 5);

    destination.close().await;
    assert_eq!(client.bulks().len(), 1);
    assert_eq!(destination.stats().unwrap().snapshot().items_acknowledged, 5);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_leaves_on_the_timer() {
    let (mut destination, client, _) = destination(&[(FLUSH_LIMIT, "100")]);
    assert!(destination.init());
    assert!(destination.open().await);

    assert!(destination.send(&record(1)).await);
    assert!(client.bulks().is_empty());

    tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(10)).await;
    assert_eq!(client.bulks().len(), 1);
}

#[tokio::test]
async fn close_flushes_pending_batch() {
    let (mut destination, client, _) = destination(&[(FLUSH_LIMIT, "10")]);
    assert!(destination.init());
    assert!(destination.open().await);

    for n in 0..3 {
        assert!(destination.send(&record(n)).await);
    }
    destination.close().await;
    assert_eq!(client.bulks().len(), 1);
    assert_eq!(client.bulks()[0].len(), 3);
}

#[tokio::test]
async fn identity_template_sets_document_id() {
    let (mut destination, client, _) = destination(&[(IDENTITY_TEMPLATE, "$app-$field")]);
    assert!(destination.init());
    assert!(destination.open().await);
    assert!(destination.send(&record(1)).await);
    assert_eq!(client.indexed()[0].identity.as_deref(), Some("billing-x"));
}

#[test]
fn port_out_of_range_fails_init() {
    let (mut destination, _, _) = destination(&[(PORT, "99999")]);
    let (ok, logged) = init_logged(&mut destination);
    assert!(!ok);
    assert!(logged.contains("port"), "{}", logged);
    assert!(logged.contains("out of range"), "{}", logged);
}

#[test]
fn unknown_client_mode_fails_init() {
    let (mut destination, _, _) = destination(&[(CLIENT_MODE, "broadcast")]);
    let (ok, logged) = init_logged(&mut destination);
    assert!(!ok);
    assert!(logged.contains("client-mode"), "{}", logged);
    assert!(logged.contains("transport, node"), "{}", logged);
}

#[test]
fn missing_required_option_fails_init() {
    let mut options = options(&[]);
    options.remove(INDEX_TEMPLATE);
    let client = Arc::new(RecordingClient::new("logs"));
    let mut destination = Destination::new(
        &options,
        Arc::new(MacroEngine),
        Arc::new(RecordingFactory::new(client)),
    );
    let (ok, logged) = init_logged(&mut destination);
    assert!(!ok);
    assert!(logged.contains("index-template"), "{}", logged);
}

#[test]
fn broken_template_fails_init() {
    let (mut destination, _, _) = destination(&[(TYPE_TEMPLATE, "$(unterminated")]);
    assert!(!destination.init());
}

#[test]
fn transport_mode_with_batches_warns() {
    let (mut destination, _, _) = destination(&[(FLUSH_LIMIT, "50")]);
    let (ok, logged) = init_logged(&mut destination);
    assert!(ok);
    assert!(logged.contains("node client mode is suggested"), "{}", logged);

    let (mut destination, _, _) = self::destination(&[(FLUSH_LIMIT, "50"), (CLIENT_MODE, "node")]);
    let (ok, logged) = init_logged(&mut destination);
    assert!(ok);
    assert!(!logged.contains("node client mode is suggested"), "{}", logged);
}

#[test]
fn deinit_after_failed_init_is_safe() {
    let (mut destination, _, _) = destination(&[(PORT, "0")]);
    assert!(!destination.init());
    destination.deinit();
    destination.deinit();
    assert_eq!(destination.state(), DestinationState::Deinitialized);
}

#[tokio::test]
async fn close_twice_is_a_no_op() {
    let (mut destination, client, _) = destination(&[]);
    assert!(destination.init());
    assert!(destination.open().await);

    destination.close().await;
    destination.close().await;
    assert_eq!(client.close_count(), 1);
    assert!(!destination.is_opened());
}

#[tokio::test]
async fn open_degrades_to_yellow() {
    let (mut destination, client, _) = destination(&[]);
    client.set_tier(HealthTier::Yellow);
    assert!(destination.init());
    assert!(destination.open().await);
    assert_eq!(client.health_requests(), vec![HealthTier::Green, HealthTier::Yellow]);
}

#[tokio::test]
async fn red_cluster_is_retried_by_the_host() {
    let (mut destination, client, factory) = destination(&[]);
    client.set_tier(HealthTier::Red);
    assert!(destination.init());

    assert!(!destination.open().await);
    assert!(!destination.open().await);
    assert!(!destination.send(&record(1)).await);

    client.set_tier(HealthTier::Green);
    assert!(destination.open().await);
    assert!(destination.send(&record(1)).await);
    // The client created by init is reused by every open.
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn single_send_failure_closes_destination() {
    let (mut destination, client, _) = destination(&[]);
    assert!(destination.init());
    assert!(destination.open().await);

    client.set_failing(true);
    assert!(!destination.send(&record(1)).await);
    assert!(!destination.is_opened());
    assert_eq!(destination.state(), DestinationState::Closed);

    client.set_failing(false);
    assert!(destination.open().await);
    assert!(destination.send(&record(2)).await);
}

#[tokio::test]
async fn custom_probe_and_batch_options() {
    let client = Arc::new(RecordingClient::new("logs"));
    client.set_tier(HealthTier::Yellow);
    let factory = RecordingFactory::new(Arc::clone(&client));
    let probe = HealthProbe {
        timeout: Duration::from_secs(1),
        preferred: HealthTier::Green,
        fallback: HealthTier::Green,
    };
    let mut destination = Destination::new(
        &options(&[(FLUSH_LIMIT, "2")]),
        Arc::new(MacroEngine),
        Arc::new(factory),
    )
    .with_health_probe(probe)
    .with_batch_options(BatchOptions {
        flush_interval: Duration::from_secs(60),
        ..BatchOptions::default()
    });

    assert!(destination.init());
    assert!(!destination.open().await);

    client.set_tier(HealthTier::Green);
    assert!(destination.open().await);
}

/// Healthy cluster whose bulk endpoint accepts requests and never answers.
struct StuckBulk;

#[async_trait]
impl ClusterClient for StuckBulk {
    async fn health(&self, _: HealthTier, _: Duration) -> Result<HealthReport, ClientError> {
        Ok(HealthReport {
            cluster_name: Some("logs".into()),
            status: HealthTier::Green,
            timed_out: false,
        })
    }

    async fn index(&self, _: &OutboundItem) -> Result<(), ClientError> {
        Ok(())
    }

    async fn bulk(&self, _: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
        std::future::pending().await
    }
}

struct StuckBulkFactory;

impl ClientFactory for StuckBulkFactory {
    fn create(&self, _: &ClientSettings) -> Result<Arc<dyn ClusterClient>, ClientError> {
        Ok(Arc::new(StuckBulk))
    }
}

#[tokio::test(start_paused = true)]
async fn close_is_bounded_when_bulk_hangs() {
    let mut destination = Destination::new(
        &options(&[(FLUSH_LIMIT, "5")]),
        Arc::new(MacroEngine),
        Arc::new(StuckBulkFactory),
    );
    assert!(destination.init());
    assert!(destination.open().await);
    assert!(destination.send(&record(1)).await);

    let started = tokio::time::Instant::now();
    let closed = tokio::time::timeout(Duration::from_secs(60), destination.close()).await;
    assert!(closed.is_ok(), "close blocked on a stuck backend");
    assert!(started.elapsed() <= CLOSE_TIMEOUT + Duration::from_millis(100));
    assert_eq!(destination.state(), DestinationState::Closed);
    assert!(!destination.is_opened());
}

#[tokio::test(start_paused = true)]
async fn close_is_bounded_while_timer_flush_hangs() {
    let mut destination = Destination::new(
        &options(&[(FLUSH_LIMIT, "5")]),
        Arc::new(MacroEngine),
        Arc::new(StuckBulkFactory),
    );
    assert!(destination.init());
    assert!(destination.open().await);
    assert!(destination.send(&record(1)).await);

    // The timer picks the item up and parks in the bulk request.
    tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(10)).await;

    let closed = tokio::time::timeout(Duration::from_secs(60), destination.close()).await;
    assert!(closed.is_ok(), "close waited for the parked timer flush");
    assert!(destination.open().await);
}

/// Answers every bulk request with one failed outcome too many.
struct OverReportingBulk;

#[async_trait]
impl ClusterClient for OverReportingBulk {
    async fn health(&self, tier: HealthTier, timeout: Duration) -> Result<HealthReport, ClientError> {
        StuckBulk.health(tier, timeout).await
    }

    async fn index(&self, _: &OutboundItem) -> Result<(), ClientError> {
        Ok(())
    }

    async fn bulk(&self, items: &[OutboundItem]) -> Result<BulkResponse, ClientError> {
        let failed = ItemOutcome {
            identity: None,
            error: Some("rejected".into()),
        };
        Ok(BulkResponse {
            took: Duration::ZERO,
            items: vec![failed; items.len() + 1],
        })
    }
}

struct OverReportingFactory;

impl ClientFactory for OverReportingFactory {
    fn create(&self, _: &ClientSettings) -> Result<Arc<dyn ClusterClient>, ClientError> {
        Ok(Arc::new(OverReportingBulk))
    }
}

#[tokio::test]
async fn malformed_bulk_response_does_not_escape_send() {
    let mut destination = Destination::new(
        &options(&[(FLUSH_LIMIT, "5")]),
        Arc::new(MacroEngine),
        Arc::new(OverReportingFactory),
    );
    assert!(destination.init());
    assert!(destination.open().await);

    for n in 0..5 {
        assert!(destination.send(&record(n)).await);
    }
    let stats = destination.stats().unwrap().snapshot();
    assert_eq!(stats.items_failed, 5);
    assert_eq!(stats.items_acknowledged, 0);
    destination.close().await;
}
