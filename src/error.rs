//! Error types shared by the option, template and client layers.

/// Validation failure raised while initializing a configuration option.
///
/// Every variant carries the option name so the host can point at the
/// offending line of its configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option `{name}` is required")]
    Required { name: String },

    #[error("option `{name}` must be numerical, got '{value}'")]
    NotNumeric { name: String, value: String },

    #[error("option `{name}` is out of range, got {value}, expected a value between {min} and {max}")]
    OutOfRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("option `{name}` must be one of [{}], got '{value}'", .allowed.join(", "))]
    NotAllowed {
        name: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("option `{name}`: can't compile template '{template}': {source}")]
    Template {
        name: String,
        template: String,
        #[source]
        source: TemplateError,
    },
}

impl OptionError {
    /// Name of the option that failed validation.
    pub fn option_name(&self) -> &str {
        match self {
            OptionError::Required { name }
            | OptionError::NotNumeric { name, .. }
            | OptionError::OutOfRange { name, .. }
            | OptionError::NotAllowed { name, .. }
            | OptionError::Template { name, .. } => name,
        }
    }
}

/// Error returned by a [`TemplateEngine`](crate::template::TemplateEngine)
/// when a template string cannot be compiled.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated macro starting at offset {0}")]
    Unterminated(usize),

    #[error("empty macro name at offset {0}")]
    EmptyName(usize),

    #[error("unknown template function '{0}'")]
    UnknownFunction(String),

    #[error("{0}")]
    Other(String),
}

/// Failure talking to the cluster backend.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("no client connection is available")]
    NotConnected,

    #[error("no usable node address in server list")]
    NoNodes,

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("connected to cluster '{actual}', expected '{expected}'")]
    ClusterMismatch { expected: String, actual: String },

    #[error("cluster '{cluster}' did not reach an acceptable health status in time")]
    Unhealthy { cluster: String },

    #[error("broker error: {0}")]
    Broker(String),
}

impl ClientError {
    /// `true` when the failure happened below the request level (connection
    /// refused, reset, timeout), as opposed to a rejected request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected | ClientError::NoNodes | ClientError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

#[cfg(feature = "elasticsearch")]
impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Failure reading an external client properties file.
#[derive(thiserror::Error, Debug)]
pub enum PropertiesError {
    #[error("unable to open properties file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed properties file {path}, line {line}")]
    Malformed { path: String, line: usize },
}
