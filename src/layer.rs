use crate::destination::Destination;
use crate::record::LogRecord;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Targets never forwarded: this crate's own output and the clients it
/// drives, which would otherwise feed back into the destination.
pub const DEFAULT_EXCLUDED_TARGETS: [&str; 5] = ["cluster_log_sink", "reqwest", "hyper", "h2", "rdkafka"];

/// Counters shared between the layer and its worker.
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Events seen by the layer, before any filtering.
    pub total_events: AtomicU64,
    /// Successfully enqueued into the channel.
    pub enqueued_events: AtomicU64,
    /// Dropped because the channel was full or the worker is gone.
    pub dropped_events: AtomicU64,
    /// Accepted by the destination.
    pub delivered_events: AtomicU64,
    /// Rejected by the destination.
    pub failed_events: AtomicU64,
}

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// forwards them to a [`Destination`] owned by a background task.
///
/// Application threads only pay for building the record and a `try_send`;
/// when the channel is full the record is dropped and counted.
pub struct DestinationLayer {
    sender: mpsc::Sender<LogRecord>,
    min_level: Level,
    service_name: Option<String>,
    excluded_targets: Vec<String>,
    pub stats: Arc<ForwardStats>,
}

impl DestinationLayer {
    /// Create the layer and spawn the worker that drives `destination`
    /// through its whole lifecycle. The worker ends once every sender is
    /// gone, after closing and deinitializing the destination.
    pub fn new(
        destination: Destination,
        buffer: usize,
        min_level: Level,
        reopen_backoff: Duration,
    ) -> (Self, JoinHandle<()>) {
        let buffer = buffer.max(16);
        let reopen_backoff = reopen_backoff.max(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel::<LogRecord>(buffer);
        let stats = Arc::new(ForwardStats::default());

        let handle = tokio::spawn(run_worker(destination, rx, reopen_backoff, Arc::clone(&stats)));

        (
            Self {
                sender: tx,
                min_level,
                service_name: None,
                excluded_targets: DEFAULT_EXCLUDED_TARGETS.iter().map(|t| t.to_string()).collect(),
                stats,
            },
            handle,
        )
    }

    /// Value of the `SERVICE` template name on every forwarded record.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Also skip events whose target starts with `prefix`.
    pub fn exclude_target(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_targets.push(prefix.into());
        self
    }

    fn is_excluded(&self, target: &str) -> bool {
        self.excluded_targets.iter().any(|p| target.starts_with(p.as_str()))
    }
}

async fn run_worker(
    mut destination: Destination,
    mut rx: mpsc::Receiver<LogRecord>,
    reopen_backoff: Duration,
    stats: Arc<ForwardStats>,
) {
    if !destination.init() {
        error!("log destination failed to initialize, forwarding disabled");
        destination.deinit();
        return;
    }

    while let Some(record) = rx.recv().await {
        while !destination.is_opened() && !destination.open().await {
            warn!(?reopen_backoff, "log destination not open, retrying");
            sleep(reopen_backoff).await;
        }

        if destination.send(&record).await {
            stats.delivered_events.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failed_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    debug!("log channel closed, shutting down destination");
    destination.close().await;
    destination.deinit();
}

impl<S> Layer<S> for DestinationLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.stats.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if *meta.level() > self.min_level || self.is_excluded(meta.target()) {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;

        let mut visitor = FieldVisitor { fields: &mut fields, message: &mut message };
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            module_path: meta.module_path().map(|s| s.to_string()),
            file: meta.file().map(|s| s.to_string()),
            line: meta.line(),
            fields,
            message,
            service_name: self.service_name.clone(),
        };

        match self.sender.try_send(record) {
            Ok(()) => {
                self.stats.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

use tracing::field::{Field, Visit};

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    // `message` arrives here as `format_args!`.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
        }
    }
}
