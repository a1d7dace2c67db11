//! Sources of raw option values.
//!
//! The destination only ever sees raw strings keyed by option name. Hosts
//! usually hand over their parsed configuration as a map; [`EnvSource`]
//! reads the same names from the environment for small services that are
//! configured through variables only.

use std::collections::{BTreeMap, HashMap};

/// Prefix used by [`EnvSource::default`].
pub const ENV_PREFIX: &str = "CLUSTER_LOG_SINK_";

/// Provides the raw, unvalidated value of an option.
pub trait OptionSource {
    fn raw_value(&self, name: &str) -> Option<String>;
}

impl OptionSource for HashMap<String, String> {
    fn raw_value(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl OptionSource for BTreeMap<String, String> {
    fn raw_value(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Reads `port` from `CLUSTER_LOG_SINK_PORT`, `flush-limit` from
/// `CLUSTER_LOG_SINK_FLUSH_LIMIT` and so on.
#[derive(Debug, Clone)]
pub struct EnvSource {
    prefix: String,
}

impl EnvSource {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        EnvSource { prefix: prefix.into() }
    }

    pub fn key(&self, name: &str) -> String {
        env_key(&self.prefix, name)
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        EnvSource::with_prefix(ENV_PREFIX)
    }
}

impl OptionSource for EnvSource {
    fn raw_value(&self, name: &str) -> Option<String> {
        std::env::var(self.key(name)).ok()
    }
}

/// Environment variable name for option `name`.
pub fn env_key(prefix: &str, name: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + name.len());
    key.push_str(prefix);
    key.extend(name.chars().map(|c| match c {
        '-' | '.' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_key_mapping() {
        assert_eq!(env_key(ENV_PREFIX, "flush-limit"), "CLUSTER_LOG_SINK_FLUSH_LIMIT");
        assert_eq!(
            EnvSource::with_prefix("APP_").key("external-properties-file"),
            "APP_EXTERNAL_PROPERTIES_FILE"
        );
    }

    #[test]
    fn reads_from_environment() {
        let source = EnvSource::with_prefix("CLUSTER_LOG_SINK_TEST_READS_");
        std::env::set_var("CLUSTER_LOG_SINK_TEST_READS_CLUSTER_NAME", "prod-logs");
        assert_eq!(source.raw_value("cluster-name").as_deref(), Some("prod-logs"));
        assert_eq!(source.raw_value("port"), None);
    }

    #[test]
    fn map_sources() {
        let mut map = HashMap::new();
        map.insert("port".to_string(), "9200".to_string());
        assert_eq!(map.raw_value("port").as_deref(), Some("9200"));
        assert_eq!(map.raw_value("cluster-name"), None);
    }
}
