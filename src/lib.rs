//! Health-gated log destination for Elasticsearch and Kafka clusters.
//!
//! A [`Destination`] validates its options, waits for the cluster to report
//! a healthy status and then ships rendered [`LogRecord`]s one by one or in
//! bulk, depending on the flush limit.

pub mod error;
pub mod record;
pub mod template;
pub mod options;
pub mod env;
pub mod properties;
pub mod client;
pub mod recording;
pub mod connection;
pub mod bulk;
pub mod delivery;
pub mod destination;
pub mod backend;
pub mod layer;
pub mod init;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use client::{ClientFactory, ClientMode, ClusterClient, HealthTier, OutboundItem};
pub use destination::{Destination, DestinationState};
pub use env::{EnvSource, OptionSource};
pub use record::LogRecord;
pub use template::{MacroEngine, TemplateEngine};
