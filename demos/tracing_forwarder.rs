use std::collections::HashMap;
use std::sync::Arc;

use cluster_log_sink::elasticsearch::ElasticsearchFactory;
use cluster_log_sink::init::{init_tracing_with_destination, LayerConfig};
use cluster_log_sink::options::{
    CLUSTER_NAME, INDEX_TEMPLATE, MESSAGE_BODY_TEMPLATE, PORT, TYPE_TEMPLATE,
};
use cluster_log_sink::{Destination, EnvSource, MacroEngine, OptionSource};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Forwards this service's own `tracing` events to Elasticsearch. Options
/// come from `CLUSTER_LOG_SINK_*` variables with a few fallbacks.
struct WithFallbacks(EnvSource, HashMap<&'static str, &'static str>);

impl OptionSource for WithFallbacks {
    fn raw_value(&self, name: &str) -> Option<String> {
        self.0
            .raw_value(name)
            .or_else(|| self.1.get(name).map(|v| v.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = WithFallbacks(
        EnvSource::default(),
        HashMap::from([
            (PORT, "9200"),
            (CLUSTER_NAME, "elasticsearch"),
            (INDEX_TEMPLATE, "auth-errors"),
            (TYPE_TEMPLATE, "event"),
            (MESSAGE_BODY_TEMPLATE, "$(format-json --scope rfc5424 --key ISODATE)"),
        ]),
    );
    let destination = Destination::new(&source, Arc::new(MacroEngine), Arc::new(ElasticsearchFactory));

    let config = LayerConfig {
        service_name: Some("auth".to_string()),
        reopen_backoff: Duration::from_secs(5),
        ..LayerConfig::default()
    };
    let _worker = init_tracing_with_destination(destination, config)?;

    info!("starting service");
    error!(user_id = 42, reason = "invalid password", "authentication failed");

    sleep(Duration::from_secs(2)).await;
    Ok(())
}
