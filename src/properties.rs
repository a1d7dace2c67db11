//! External client properties.
//!
//! The `external-properties-file` option points at a Java-style properties
//! file with extra client settings. Its entries are merged *under* the
//! destination's built-in properties: a file can add settings but can never
//! override the ones the destination derives from its own options.

use crate::error::PropertiesError;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;
use tracing::{debug, error};

pub type Properties = BTreeMap<String, String>;

/// Parse properties text: `key=value`, `key: value` or `key value` per
/// line, `#`/`!` comments, a trailing unescaped `\` continues a line.
/// Backslash escapes (`\=`, `\:`, `\ `, `\\`, `\t`, `\n`, `\r`, `\f`
/// and `\uXXXX`) are honored in keys and values.
pub fn parse(text: &str, path: &str) -> Result<Properties, PropertiesError> {
    let mut properties = Properties::new();
    let mut pending = String::new();
    let mut pending_line = 0;
    let mut continued = false;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim_start();
        if !continued {
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            pending_line = index + 1;
        }

        continued = ends_with_continuation(line);
        if continued {
            pending.push_str(&line[..line.len() - 1]);
            continue;
        }
        pending.push_str(line);

        let entry = std::mem::take(&mut pending);
        insert_entry(&mut properties, &entry, path, pending_line)?;
    }

    if continued {
        insert_entry(&mut properties, &pending, path, pending_line)?;
    }

    Ok(properties)
}

// An odd run of trailing backslashes; an even run is escaped backslashes.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn insert_entry(
    properties: &mut Properties,
    entry: &str,
    path: &str,
    line: usize,
) -> Result<(), PropertiesError> {
    let (key, value) = split_entry(entry);
    if key.is_empty() {
        return Err(PropertiesError::Malformed {
            path: path.to_string(),
            line,
        });
    }
    properties.insert(key, value);
    Ok(())
}

fn split_entry(entry: &str) -> (String, String) {
    let mut chars = entry.chars().peekable();
    let mut key = String::new();
    let mut separated = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => push_escaped(&mut key, &mut chars),
            '=' | ':' => {
                separated = true;
                break;
            }
            c if c.is_whitespace() => break,
            c => key.push(c),
        }
    }

    while chars.next_if(|c| c.is_whitespace()).is_some() {}
    if !separated && chars.next_if(|&c| c == '=' || c == ':').is_some() {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == '\\' {
            push_escaped(&mut value, &mut chars);
        } else {
            value.push(c);
        }
    }
    (key, value)
}

fn push_escaped(out: &mut String, chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        Some('t') => out.push('\t'),
        Some('n') => out.push('\n'),
        Some('r') => out.push('\r'),
        Some('f') => out.push('\u{c}'),
        Some('u') => {
            let hex: String = (0..4)
                .filter_map(|_| chars.next_if(|c| c.is_ascii_hexdigit()))
                .collect();
            let decoded = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32);
            match decoded {
                Some(c) if hex.len() == 4 => out.push(c),
                // Malformed escapes are kept as written.
                _ => {
                    out.push('u');
                    out.push_str(&hex);
                }
            }
        }
        Some(c) => out.push(c),
        None => {}
    }
}

pub fn load(path: &Path) -> Result<Properties, PropertiesError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| PropertiesError::Io {
        path: display.clone(),
        source,
    })?;
    parse(&text, &display)
}

/// Merge the file at `path` (if any) under `builtin`.
///
/// A file that cannot be read or parsed is logged and ignored; the built-in
/// properties are returned unchanged.
pub fn merge_with_file(builtin: Properties, path: Option<&Path>) -> Properties {
    let Some(path) = path else {
        return builtin;
    };

    match load(path) {
        Ok(mut merged) => {
            debug!(path = %path.display(), entries = merged.len(), "properties file loaded");
            merged.extend(builtin);
            merged
        }
        Err(e) => {
            error!(error = %e, "unable to load properties");
            builtin
        }
    }
}
