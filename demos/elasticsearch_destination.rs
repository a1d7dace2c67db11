use std::collections::HashMap;
use std::sync::Arc;

use cluster_log_sink::backend::{make_factory, BackendKind};
use cluster_log_sink::env::env_or;
use cluster_log_sink::init::init_logging;
use cluster_log_sink::options::{
    CLUSTER_NAME, FLUSH_LIMIT, INDEX_TEMPLATE, MESSAGE_BODY_TEMPLATE, PORT, SERVER_LIST,
    TYPE_TEMPLATE,
};
use cluster_log_sink::{Destination, LogRecord, MacroEngine};
use tokio::time::{sleep, Duration};

/// Drives a destination by hand the way a log pipeline would: init once,
/// open until it succeeds, send while open.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info")?;

    let backend: BackendKind = env_or("CLUSTER_LOG_SINK_BACKEND", "elasticsearch").parse()?;
    let options: HashMap<String, String> = [
        (SERVER_LIST, env_or("ES_SERVERS", "127.0.0.1")),
        (PORT, env_or("ES_PORT", "9200")),
        (CLUSTER_NAME, env_or("ES_CLUSTER", "elasticsearch")),
        (INDEX_TEMPLATE, "demo-$LEVEL".to_string()),
        (TYPE_TEMPLATE, "event".to_string()),
        (MESSAGE_BODY_TEMPLATE, "$(format-json --key ISODATE)".to_string()),
        (FLUSH_LIMIT, "10".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let mut destination = Destination::new(&options, Arc::new(MacroEngine), make_factory(backend)?);
    if !destination.init() {
        return Err("invalid destination options".into());
    }

    while !destination.open().await {
        sleep(Duration::from_secs(5)).await;
    }

    for n in 0..25 {
        let record = LogRecord::new("INFO", format!("demo message {}", n)).with_field("n", n);
        if !destination.send(&record).await {
            break;
        }
    }

    destination.close().await;
    if let Some(stats) = destination.stats() {
        println!("{:?}", stats.snapshot());
    }
    destination.deinit();
    Ok(())
}
