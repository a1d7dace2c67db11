//! Template rendering capability consumed by template options.
//!
//! The destination never interprets template text itself. It asks a
//! [`TemplateEngine`] to compile each template option once during
//! initialization and calls [`Template::format`] for every record. Hosts with
//! their own template language plug it in here; [`MacroEngine`] is the
//! built-in implementation.

use crate::error::TemplateError;
use crate::record::LogRecord;
use std::fmt;
use std::sync::Arc;

/// A compiled template, ready to render records.
pub trait Template: Send + Sync + fmt::Debug {
    fn format(&self, record: &LogRecord) -> String;
}

/// Compiles template strings into [`Template`] programs.
pub trait TemplateEngine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn Template>, TemplateError>;
}

/// Built-in engine understanding `$NAME`, `$(NAME)`, `${NAME}`, `$$` and the
/// `$(format-json ...)` function.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacroEngine;

impl TemplateEngine for MacroEngine {
    fn compile(&self, source: &str) -> Result<Arc<dyn Template>, TemplateError> {
        Ok(Arc::new(MacroTemplate {
            segments: parse(source)?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
    FormatJson(JsonSpec),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct JsonSpec {
    keys: Vec<String>,
    excludes: Vec<String>,
}

#[derive(Debug)]
struct MacroTemplate {
    segments: Vec<Segment>,
}

impl Template for MacroTemplate {
    fn format(&self, record: &LogRecord) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    if let Some(value) = record.field(name) {
                        out.push_str(&value);
                    }
                }
                Segment::FormatJson(spec) => out.push_str(&format_json(spec, record)),
            }
        }
        out
    }
}

fn format_json(spec: &JsonSpec, record: &LogRecord) -> String {
    let mut object = serde_json::Map::new();

    if let Some(message) = &record.message {
        object.insert("MESSAGE".into(), message.clone().into());
    }
    object.insert("LEVEL".into(), record.level.clone().into());
    if !record.target.is_empty() {
        object.insert("TARGET".into(), record.target.clone().into());
    }
    if let Some(service) = &record.service_name {
        object.insert("SERVICE".into(), service.clone().into());
    }
    for (name, value) in &record.fields {
        object.insert(name.clone(), value.clone());
    }
    for key in &spec.keys {
        if let Some(value) = record.field(key) {
            object.insert(key.clone(), value.into_owned().into());
        }
    }
    for name in &spec.excludes {
        object.remove(name);
    }

    serde_json::Value::Object(object).to_string()
}

fn parse(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let bytes = source.as_bytes();
    let mut pos = 0;

    while pos < source.len() {
        let Some(offset) = source[pos..].find('$') else {
            literal.push_str(&source[pos..]);
            break;
        };
        let start = pos + offset;
        literal.push_str(&source[pos..start]);

        let (segment, next) = match bytes.get(start + 1) {
            Some(b'$') => (None, start + 2),
            Some(b'(') => {
                let (body, next) = enclosed(source, start, ')')?;
                (Some(paren_macro(body, start)?), next)
            }
            Some(b'{') => {
                let (body, next) = enclosed(source, start, '}')?;
                let name = body.trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyName(start));
                }
                (Some(Segment::Field(name.to_string())), next)
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == b'_' => {
                let end = source[start + 1..]
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                    .map(|i| start + 1 + i)
                    .unwrap_or(source.len());
                (Some(Segment::Field(source[start + 1..end].to_string())), end)
            }
            _ => {
                literal.push('$');
                pos = start + 1;
                continue;
            }
        };

        match segment {
            None => literal.push('$'),
            Some(segment) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
            }
        }
        pos = next;
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Returns the text between `$(`/`${` at `start` and `close`, plus the offset
/// right after the closing character.
fn enclosed(source: &str, start: usize, close: char) -> Result<(&str, usize), TemplateError> {
    let body_start = start + 2;
    match source[body_start..].find(close) {
        Some(len) => Ok((&source[body_start..body_start + len], body_start + len + 1)),
        None => Err(TemplateError::Unterminated(start)),
    }
}

fn paren_macro(body: &str, start: usize) -> Result<Segment, TemplateError> {
    let mut words = body.split_whitespace();
    let Some(name) = words.next() else {
        return Err(TemplateError::EmptyName(start));
    };
    let args: Vec<&str> = words.collect();

    if name == "format-json" {
        return json_spec(&args).map(Segment::FormatJson);
    }
    if !args.is_empty() {
        return Err(TemplateError::UnknownFunction(name.to_string()));
    }
    Ok(Segment::Field(name.to_string()))
}

fn json_spec(args: &[&str]) -> Result<JsonSpec, TemplateError> {
    let mut spec = JsonSpec::default();
    let mut args = args.iter();

    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .map(|v| v.to_string())
                .ok_or_else(|| TemplateError::Other(format!("format-json: {} needs a value", flag)))
        };
        match *flag {
            // All record fields are always rendered, so the scope only needs to parse.
            "--scope" => {
                value()?;
            }
            "--key" => spec.keys.push(value()?),
            "--exclude" => spec.excludes.push(value()?),
            other => {
                return Err(TemplateError::Other(format!(
                    "format-json: unknown argument '{}'",
                    other
                )))
            }
        }
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(template: &str, record: &LogRecord) -> String {
        MacroEngine.compile(template).unwrap().format(record)
    }

    #[test]
    fn field_reference_round_trip() {
        let record = LogRecord::new("INFO", "hello").with_field("field", "x");
        assert_eq!(render("$(field)", &record), "x");
        assert_eq!(render("${field}", &record), "x");
        assert_eq!(render("$field", &record), "x");
    }

    #[test]
    fn mixes_literals_and_macros() {
        let record = LogRecord::new("WARN", "hello").with_field("app", "billing");
        assert_eq!(render("logs-$(app)-${LEVEL}", &record), "logs-billing-WARN");
        assert_eq!(render("cost: $$5 $", &record), "cost: $5 $");
    }

    #[test]
    fn missing_field_renders_empty() {
        let record = LogRecord::new("INFO", "hello");
        assert_eq!(render("id-$(nope)", &record), "id-");
    }

    #[test]
    fn format_json_with_key_and_exclude() {
        let record = LogRecord::new("ERROR", "boom")
            .with_field("user", "alice")
            .with_field("DATE", "yesterday");
        let body = render("$(format-json --scope rfc5424 --exclude DATE --key ISODATE)", &record);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["MESSAGE"], "boom");
        assert_eq!(value["LEVEL"], "ERROR");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["ISODATE"], record.isodate());
        assert!(value.get("DATE").is_none());
    }

    #[test]
    fn compile_errors() {
        assert_eq!(
            MacroEngine.compile("abc $(field").unwrap_err(),
            TemplateError::Unterminated(4)
        );
        assert_eq!(MacroEngine.compile("${ }").unwrap_err(), TemplateError::EmptyName(0));
        assert_eq!(
            MacroEngine.compile("$(substr MSG 0 3)").unwrap_err(),
            TemplateError::UnknownFunction("substr".into())
        );
        assert!(MacroEngine.compile("$(format-json --bogus)").is_err());
    }
}
