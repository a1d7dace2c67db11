use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// One structured log record handed to a [`Destination`](crate::destination::Destination).
///
/// Templates read the well-known fields through upper-case names
/// (`MESSAGE`, `LEVEL`, `ISODATE`, ...) and any entry of `fields` by its own
/// name. See [`LogRecord::field`].
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub message: Option<String>,
    pub service_name: Option<String>,
}

impl LogRecord {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level: level.into(),
            target: String::new(),
            module_path: None,
            file: None,
            line: None,
            fields: BTreeMap::new(),
            message: Some(message.into()),
            service_name: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Look up a value by template name.
    ///
    /// Entries in `fields` shadow the built-in names, so a record carrying a
    /// `MESSAGE` field renders that field rather than `message`. String
    /// values are returned without JSON quoting.
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        if let Some(value) = self.fields.get(name) {
            return Some(match value {
                serde_json::Value::String(s) => Cow::Borrowed(s.as_str()),
                other => Cow::Owned(other.to_string()),
            });
        }

        match name {
            "MESSAGE" | "MSG" => self.message.as_deref().map(Cow::Borrowed),
            "LEVEL" | "PRIORITY" => Some(Cow::Borrowed(self.level.as_str())),
            "TARGET" | "PROGRAM" => Some(Cow::Borrowed(self.target.as_str())),
            "MODULE" => self.module_path.as_deref().map(Cow::Borrowed),
            "FILE" => self.file.as_deref().map(Cow::Borrowed),
            "LINE" => self.line.map(|l| Cow::Owned(l.to_string())),
            "SERVICE" => self.service_name.as_deref().map(Cow::Borrowed),
            "ISODATE" => Some(Cow::Owned(self.isodate())),
            _ => None,
        }
    }

    /// RFC 3339 timestamp with millisecond precision.
    pub fn isodate(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
