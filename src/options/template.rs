use super::ConfigOption;
use crate::error::OptionError;
use crate::record::LogRecord;
use crate::template::{Template, TemplateEngine};
use std::sync::Arc;

/// A checked string option whose value is compiled into a [`Template`].
///
/// The wrapped option is initialized first, so a missing required template
/// reports the required error rather than a compile error.
#[derive(Debug)]
pub struct TemplateOption {
    option: ConfigOption,
    compiled: Option<Arc<dyn Template>>,
}

impl TemplateOption {
    pub fn new(option: ConfigOption) -> Self {
        TemplateOption { option, compiled: None }
    }

    pub fn option(&self) -> &ConfigOption {
        &self.option
    }

    pub fn option_mut(&mut self) -> &mut ConfigOption {
        &mut self.option
    }

    pub fn init(&mut self, engine: &dyn TemplateEngine) -> Result<(), OptionError> {
        self.option.init()?;
        if let Some(source) = self.option.value() {
            let template = engine.compile(source).map_err(|e| OptionError::Template {
                name: self.option.name().to_string(),
                template: source.to_string(),
                source: e,
            })?;
            self.compiled = Some(template);
        }
        Ok(())
    }

    /// Render the template against `record`; `None` when no template was
    /// configured.
    pub fn resolve(&self, record: &LogRecord) -> Option<String> {
        self.compiled.as_ref().map(|t| t.format(record))
    }

    pub fn template(&self) -> Option<Arc<dyn Template>> {
        self.compiled.clone()
    }

    pub fn deinit(&mut self) {
        self.compiled = None;
        self.option.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MacroEngine;

    #[test]
    fn compiles_and_resolves() {
        let mut option = TemplateOption::new(
            ConfigOption::new("index-template").required().with_raw(Some("$(field)".into())),
        );
        option.init(&MacroEngine).unwrap();

        let record = LogRecord::new("INFO", "msg").with_field("field", "x");
        assert_eq!(option.resolve(&record).as_deref(), Some("x"));
    }

    #[test]
    fn absent_optional_template_resolves_to_none() {
        let mut option = TemplateOption::new(ConfigOption::new("identity-template"));
        option.init(&MacroEngine).unwrap();
        assert_eq!(option.resolve(&LogRecord::new("INFO", "msg")), None);
    }

    #[test]
    fn required_checked_before_compile() {
        let mut option = TemplateOption::new(ConfigOption::new("type-template").required());
        let err = option.init(&MacroEngine).unwrap_err();
        assert!(matches!(err, OptionError::Required { .. }));
    }

    #[test]
    fn compile_failure_names_option() {
        let mut option = TemplateOption::new(
            ConfigOption::new("index-template").with_raw(Some("$(unterminated".into())),
        );
        let err = option.init(&MacroEngine).unwrap_err();
        assert_eq!(err.option_name(), "index-template");
        assert!(matches!(err, OptionError::Template { .. }));
    }

    #[test]
    fn deinit_releases_template() {
        let mut option = TemplateOption::new(ConfigOption::new("t").with_raw(Some("$(a)".into())));
        option.deinit();
        option.init(&MacroEngine).unwrap();
        assert!(option.template().is_some());
        option.deinit();
        option.deinit();
        assert!(option.template().is_none());
    }
}
