//! Configuration options and their validation chains.
//!
//! An option is a named raw string plus an optional default. Constraints are
//! attached as an ordered list of [`Check`]s; [`ConfigOption::init`]
//! materializes the effective value and runs the checks in the order they
//! were attached, stopping at the first failure. Attaching `required` before
//! `range` therefore means "required, then range-checked": a missing value
//! reports the required error, never the range error.

mod registry;
mod template;

pub use registry::{
    DestinationOptions, RecordRenderer, ResolvedOptions, CLIENT_MODE, CLUSTER_NAME,
    FLUSH_LIMIT, IDENTITY_TEMPLATE, INDEX_TEMPLATE, MESSAGE_BODY_TEMPLATE,
    MESSAGE_BODY_TEMPLATE_DEFAULT, PORT, PROPERTIES_FILE, SERVER_LIST, TYPE_TEMPLATE,
};
pub use template::TemplateOption;

use crate::error::OptionError;

/// One validation step applied to an option's effective value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// The value must be present and not blank.
    Required,
    /// The value must parse as an integer.
    Numeric,
    /// The value must parse as an integer within `[min, max]`.
    Range { min: i64, max: i64 },
    /// The value must be one of the listed strings.
    OneOf(Vec<String>),
}

impl Check {
    /// Absent values only fail [`Check::Required`]; every other check is
    /// skipped for an optional option that has no value.
    fn apply(&self, name: &str, value: Option<&str>) -> Result<(), OptionError> {
        let value = match (self, value) {
            (Check::Required, None) => {
                return Err(OptionError::Required { name: name.to_string() })
            }
            (Check::Required, Some(v)) if v.trim().is_empty() => {
                return Err(OptionError::Required { name: name.to_string() })
            }
            (_, None) => return Ok(()),
            (_, Some(v)) => v,
        };

        match self {
            Check::Required => Ok(()),
            Check::Numeric => parse_int(name, value).map(|_| ()),
            Check::Range { min, max } => {
                let parsed = parse_int(name, value)?;
                if parsed < *min || parsed > *max {
                    return Err(OptionError::OutOfRange {
                        name: name.to_string(),
                        value: parsed,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(())
            }
            Check::OneOf(allowed) => {
                if allowed.iter().any(|a| a == value) {
                    Ok(())
                } else {
                    Err(OptionError::NotAllowed {
                        name: name.to_string(),
                        value: value.to_string(),
                        allowed: allowed.clone(),
                    })
                }
            }
        }
    }
}

pub(crate) fn parse_int(name: &str, value: &str) -> Result<i64, OptionError> {
    value.trim().parse::<i64>().map_err(|_| OptionError::NotNumeric {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// A named configuration cell with a raw value, a default and a check chain.
#[derive(Debug, Clone)]
pub struct ConfigOption {
    name: &'static str,
    raw: Option<String>,
    default: Option<String>,
    checks: Vec<Check>,
    value: Option<String>,
    initialized: bool,
}

impl ConfigOption {
    pub fn new(name: &'static str) -> Self {
        ConfigOption {
            name,
            raw: None,
            default: None,
            checks: Vec::new(),
            value: None,
            initialized: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_raw(mut self, raw: Option<String>) -> Self {
        self.raw = raw;
        self
    }

    /// Append a check to the end of the chain.
    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn required(self) -> Self {
        self.check(Check::Required)
    }

    pub fn numeric(self) -> Self {
        self.check(Check::Numeric)
    }

    pub fn range(self, min: i64, max: i64) -> Self {
        self.check(Check::Range { min, max })
    }

    pub fn one_of(self, allowed: &[&str]) -> Self {
        self.check(Check::OneOf(allowed.iter().map(|s| s.to_string()).collect()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set_raw(&mut self, raw: Option<String>) {
        self.raw = raw;
    }

    /// Materialize the effective value (raw, else default) and run the check
    /// chain over it.
    pub fn init(&mut self) -> Result<(), OptionError> {
        let effective = self.raw.clone().or_else(|| self.default.clone());
        for check in &self.checks {
            check.apply(self.name, effective.as_deref())?;
        }
        self.value = effective;
        self.initialized = true;
        Ok(())
    }

    /// Effective value; `None` before a successful [`init`](Self::init) or
    /// for an optional option without a value.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn deinit(&mut self) {
        self.value = None;
        self.initialized = false;
    }

    /// Split the value on `separator`, dropping empty parts.
    pub fn value_as_list(&self, separator: char) -> Vec<String> {
        self.value()
            .map(|v| {
                v.split(separator)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn value_as_int(&self) -> Option<Result<i64, OptionError>> {
        self.value().map(|v| parse_int(self.name, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_err(option: ConfigOption) -> OptionError {
        let mut option = option;
        option.init().expect_err("init should fail")
    }

    #[test]
    fn raw_value_wins_over_default() {
        let mut option = ConfigOption::new("server-list")
            .with_default("localhost")
            .with_raw(Some("es1 es2".into()));
        option.init().unwrap();
        assert_eq!(option.value(), Some("es1 es2"));
        assert_eq!(option.value_as_list(' '), vec!["es1", "es2"]);
    }

    #[test]
    fn default_used_when_raw_absent() {
        let mut option = ConfigOption::new("port").with_default("9300").numeric();
        option.init().unwrap();
        assert_eq!(option.value(), Some("9300"));
        assert_eq!(option.value_as_int().unwrap().unwrap(), 9300);
    }

    #[test]
    fn missing_optional_value_is_valid() {
        let mut option = ConfigOption::new("identity-template").numeric().range(0, 10);
        option.init().unwrap();
        assert_eq!(option.value(), None);
    }

    #[test]
    fn required_reported_before_range() {
        let err = init_err(ConfigOption::new("port").required().range(1, 65535));
        assert_eq!(err, OptionError::Required { name: "port".into() });
    }

    #[test]
    fn blank_value_fails_required() {
        let err = init_err(ConfigOption::new("cluster-name").required().with_raw(Some("  ".into())));
        assert!(matches!(err, OptionError::Required { .. }));
    }

    #[test]
    fn numeric_and_range() {
        let err = init_err(ConfigOption::new("port").with_raw(Some("http".into())).numeric());
        assert!(matches!(err, OptionError::NotNumeric { .. }));

        let err = init_err(ConfigOption::new("port").with_raw(Some("99999".into())).numeric().range(1, 65535));
        assert_eq!(
            err,
            OptionError::OutOfRange { name: "port".into(), value: 99999, min: 1, max: 65535 }
        );
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn one_of() {
        let mut ok = ConfigOption::new("client-mode").with_raw(Some("node".into())).one_of(&["transport", "node"]);
        ok.init().unwrap();

        let err = init_err(
            ConfigOption::new("client-mode")
                .with_raw(Some("broadcast".into()))
                .one_of(&["transport", "node"]),
        );
        assert!(matches!(err, OptionError::NotAllowed { .. }));
    }

    #[test]
    fn failed_init_leaves_no_value_and_deinit_is_idempotent() {
        let mut option = ConfigOption::new("port").with_raw(Some("0".into())).range(1, 65535);
        assert!(option.init().is_err());
        assert!(!option.is_initialized());
        option.deinit();
        option.deinit();
        assert_eq!(option.value(), None);
    }
}
