use std::str::FromStr;
use std::sync::Arc;

use crate::client::ClientFactory;

/// Supported cluster backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Elasticsearch,
    Kafka,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Elasticsearch => "elasticsearch",
            BackendKind::Kafka => "kafka",
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendBuildError;

    /// Accepts the backend name or a URL-style prefix such as
    /// `kafka://broker1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.split("://").next().unwrap_or_default();
        match name {
            "elasticsearch" | "es" => Ok(BackendKind::Elasticsearch),
            "kafka" => Ok(BackendKind::Kafka),
            _ => Err(BackendBuildError::UnknownBackend(s.to_string())),
        }
    }
}

/// Error type returned when selecting a backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendBuildError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{}' requires the '{}' feature", .0.as_str(), .0.as_str())]
    FeatureDisabled(BackendKind),
}

/// Client factory of the selected backend.
///
/// This is the main entry point for hosts that pick the backend by name
/// instead of constructing a factory directly.
pub fn make_factory(kind: BackendKind) -> Result<Arc<dyn ClientFactory>, BackendBuildError> {
    match kind {
        BackendKind::Elasticsearch => {
            #[cfg(feature = "elasticsearch")]
            {
                Ok(Arc::new(crate::elasticsearch::ElasticsearchFactory) as Arc<dyn ClientFactory>)
            }

            #[cfg(not(feature = "elasticsearch"))]
            {
                Err(BackendBuildError::FeatureDisabled(kind))
            }
        }
        BackendKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                Ok(Arc::new(crate::kafka::KafkaFactory) as Arc<dyn ClientFactory>)
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(BackendBuildError::FeatureDisabled(kind))
            }
        }
    }
}
