use super::{ConfigOption, TemplateOption};
use crate::client::{ClientMode, OutboundItem};
use crate::env::OptionSource;
use crate::error::OptionError;
use crate::record::LogRecord;
use crate::template::{Template, TemplateEngine};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const SERVER_LIST: &str = "server-list";
pub const PORT: &str = "port";
pub const CLUSTER_NAME: &str = "cluster-name";
pub const INDEX_TEMPLATE: &str = "index-template";
pub const TYPE_TEMPLATE: &str = "type-template";
pub const MESSAGE_BODY_TEMPLATE: &str = "message-body-template";
pub const IDENTITY_TEMPLATE: &str = "identity-template";
pub const FLUSH_LIMIT: &str = "flush-limit";
pub const CLIENT_MODE: &str = "client-mode";
pub const PROPERTIES_FILE: &str = "external-properties-file";

pub const SERVER_LIST_DEFAULT: &str = "localhost";
pub const PORT_DEFAULT: &str = "9300";
pub const MESSAGE_BODY_TEMPLATE_DEFAULT: &str =
    "$(format-json --scope rfc5424 --exclude DATE --key ISODATE)";
pub const FLUSH_LIMIT_DEFAULT: &str = "1";

#[derive(Debug)]
enum Entry {
    Value(ConfigOption),
    Template(TemplateOption),
}

impl Entry {
    fn option(&self) -> &ConfigOption {
        match self {
            Entry::Value(option) => option,
            Entry::Template(template) => template.option(),
        }
    }

    fn option_mut(&mut self) -> &mut ConfigOption {
        match self {
            Entry::Value(option) => option,
            Entry::Template(template) => template.option_mut(),
        }
    }
}

/// Named collection of the destination's options.
#[derive(Debug, Default)]
pub struct DestinationOptions {
    entries: BTreeMap<&'static str, Entry>,
}

impl DestinationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the default options, raw values read from `source`.
    pub fn from_source(source: &dyn OptionSource) -> Self {
        let mut options = Self::new();
        options.register_defaults();
        options.load(source);
        options
    }

    /// Register the fixed set of destination options with their defaults and
    /// check chains.
    pub fn register_defaults(&mut self) {
        self.register(ConfigOption::new(SERVER_LIST).with_default(SERVER_LIST_DEFAULT));
        self.register(
            ConfigOption::new(PORT)
                .with_default(PORT_DEFAULT)
                .required()
                .numeric()
                .range(1, 65535),
        );
        self.register(ConfigOption::new(CLUSTER_NAME).required());
        self.register_template(ConfigOption::new(INDEX_TEMPLATE).required());
        self.register_template(ConfigOption::new(TYPE_TEMPLATE).required());
        self.register_template(
            ConfigOption::new(MESSAGE_BODY_TEMPLATE).with_default(MESSAGE_BODY_TEMPLATE_DEFAULT),
        );
        self.register_template(ConfigOption::new(IDENTITY_TEMPLATE));
        self.register(
            ConfigOption::new(FLUSH_LIMIT)
                .with_default(FLUSH_LIMIT_DEFAULT)
                .numeric()
                .range(0, i32::MAX as i64),
        );
        self.register(
            ConfigOption::new(CLIENT_MODE)
                .with_default(ClientMode::default().as_str())
                .one_of(&ClientMode::NAMES),
        );
        self.register(ConfigOption::new(PROPERTIES_FILE));
    }

    pub fn register(&mut self, option: ConfigOption) {
        self.entries.insert(option.name(), Entry::Value(option));
    }

    pub fn register_template(&mut self, option: ConfigOption) {
        self.entries
            .insert(option.name(), Entry::Template(TemplateOption::new(option)));
    }

    /// Read the raw value of every registered option from `source`.
    pub fn load(&mut self, source: &dyn OptionSource) {
        for (name, entry) in self.entries.iter_mut() {
            entry.option_mut().set_raw(source.raw_value(name));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ConfigOption> {
        self.entries.get(name).map(Entry::option)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Initialize every option, stopping at the first failure.
    ///
    /// Options initialized before the failure are left as they are;
    /// [`deinit`](Self::deinit) cleans up either way.
    pub fn init(&mut self, engine: &dyn TemplateEngine) -> Result<ResolvedOptions, OptionError> {
        for entry in self.entries.values_mut() {
            match entry {
                Entry::Value(option) => option.init()?,
                Entry::Template(template) => template.init(engine)?,
            }
        }
        self.resolve()
    }

    pub fn deinit(&mut self) {
        for entry in self.entries.values_mut() {
            match entry {
                Entry::Value(option) => option.deinit(),
                Entry::Template(template) => template.deinit(),
            }
        }
    }

    fn resolve(&self) -> Result<ResolvedOptions, OptionError> {
        let client_mode = self.required_value(CLIENT_MODE)?;
        let client_mode = client_mode
            .parse::<ClientMode>()
            .map_err(|value| OptionError::NotAllowed {
                name: CLIENT_MODE.to_string(),
                value,
                allowed: ClientMode::NAMES.iter().map(|s| s.to_string()).collect(),
            })?;

        Ok(ResolvedOptions {
            servers: self
                .get(SERVER_LIST)
                .map(|o| o.value_as_list(' '))
                .unwrap_or_default(),
            port: self.int_value(PORT)? as u16,
            cluster_name: self.required_value(CLUSTER_NAME)?.to_string(),
            flush_limit: self.int_value(FLUSH_LIMIT)? as usize,
            client_mode,
            properties_file: self
                .get(PROPERTIES_FILE)
                .and_then(ConfigOption::value)
                .map(PathBuf::from),
            renderer: RecordRenderer {
                index: self.required_template(INDEX_TEMPLATE)?,
                subtype: self.required_template(TYPE_TEMPLATE)?,
                body: self.required_template(MESSAGE_BODY_TEMPLATE)?,
                identity: self.template(IDENTITY_TEMPLATE),
            },
        })
    }

    fn required_value(&self, name: &'static str) -> Result<&str, OptionError> {
        self.get(name)
            .and_then(ConfigOption::value)
            .ok_or_else(|| OptionError::Required { name: name.to_string() })
    }

    fn int_value(&self, name: &'static str) -> Result<i64, OptionError> {
        self.get(name)
            .and_then(ConfigOption::value_as_int)
            .unwrap_or_else(|| Err(OptionError::Required { name: name.to_string() }))
    }

    fn template(&self, name: &str) -> Option<Arc<dyn Template>> {
        match self.entries.get(name) {
            Some(Entry::Template(template)) => template.template(),
            _ => None,
        }
    }

    fn required_template(&self, name: &'static str) -> Result<Arc<dyn Template>, OptionError> {
        self.template(name)
            .ok_or_else(|| OptionError::Required { name: name.to_string() })
    }
}

/// Typed view of the options after a successful
/// [`DestinationOptions::init`].
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub servers: Vec<String>,
    pub port: u16,
    pub cluster_name: String,
    pub flush_limit: usize,
    pub client_mode: ClientMode,
    pub properties_file: Option<PathBuf>,
    pub renderer: RecordRenderer,
}

/// Compiled record templates; turns a record into an [`OutboundItem`].
#[derive(Debug, Clone)]
pub struct RecordRenderer {
    index: Arc<dyn Template>,
    subtype: Arc<dyn Template>,
    body: Arc<dyn Template>,
    identity: Option<Arc<dyn Template>>,
}

impl RecordRenderer {
    pub fn render(&self, record: &LogRecord) -> OutboundItem {
        OutboundItem {
            collection: self.index.format(record),
            subtype: self.subtype.format(record),
            identity: self.identity.as_ref().map(|t| t.format(record)),
            payload: self.body.format(record),
        }
    }
}
