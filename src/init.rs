use crate::destination::Destination;
use crate::layer::DestinationLayer;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration of the forwarding layer.
///
/// - `channel_buffer`: records queued for the destination before new ones
///   are dropped.
/// - `min_level`: least severe level forwarded.
/// - `reopen_backoff`: pause between attempts to open the destination.
/// - `service_name`: value of `SERVICE` on every record.
/// - `enable_stdout`: also print events to the console through a `fmt`
///   layer filtered by `RUST_LOG`.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub channel_buffer: usize,
    pub min_level: Level,
    pub reopen_backoff: Duration,
    pub service_name: Option<String>,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            min_level: Level::INFO,
            reopen_backoff: Duration::from_secs(60),
            service_name: None,
            enable_stdout: true,
        }
    }
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a console subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info"` or `"cluster_log_sink=debug"`).
pub fn init_logging(default_directive: &str) -> Result<(), SetGlobalDefaultError> {
    let subscriber = Registry::default()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter(default_directive)));
    tracing::subscriber::set_global_default(subscriber)
}

/// Install a global subscriber forwarding events to `destination`.
///
/// Must be called from within a Tokio runtime. The returned handle
/// belongs to the worker that owns the destination.
pub fn init_tracing_with_destination(
    destination: Destination,
    config: LayerConfig,
) -> Result<JoinHandle<()>, SetGlobalDefaultError> {
    let (mut layer, handle) = DestinationLayer::new(
        destination,
        config.channel_buffer,
        config.min_level,
        config.reopen_backoff,
    );
    if let Some(service_name) = config.service_name {
        layer = layer.with_service_name(service_name);
    }

    // Two shapes because the layered subscriber types differ.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter("info"));
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(handle)
}

/// [`init_tracing_with_destination`] with [`LayerConfig::default`].
pub fn init_tracing(destination: Destination) -> Result<JoinHandle<()>, SetGlobalDefaultError> {
    init_tracing_with_destination(destination, LayerConfig::default())
}
