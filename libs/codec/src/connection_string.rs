//! `key=value; key={nested; value}` connection-string settings
//!
//! Keys are case-insensitive. A value wrapped in braces keeps its inner
//! semicolons and loses exactly one level of braces.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{CodecError, Result};

/// Parsed connection-string settings with case-insensitive keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    values: BTreeMap<String, String>,
}

impl ConnectionSettings {
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for segment in split_top_level(text, ';')? {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                CodecError::ConnectionString(format!("setting \"{segment}\" has no value"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CodecError::ConnectionString(format!(
                    "setting \"{segment}\" has no key"
                )));
            }
            values.insert(key.to_ascii_lowercase(), unwrap_braces(value.trim()).to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    /// Parses a setting; `Ok(None)` when absent.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                CodecError::ConnectionString(format!("invalid value for \"{key}\": {e}"))
            }),
        }
    }

    /// Parses a case-insensitive boolean, also accepting `1`/`0`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|raw| {
            let raw = raw.trim();
            raw.eq_ignore_ascii_case("true") || raw == "1" || raw.eq_ignore_ascii_case("yes")
        })
    }

    /// Parses a nested settings block such as `dataChannel={port=9500}`.
    pub fn get_nested(&self, key: &str) -> Result<Option<ConnectionSettings>> {
        self.get(key).map(Self::parse).transpose()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Splits a list value on `;` or `,`, trimming and dropping empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_top_level(text: &str, separator: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (offset, c) in text.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    CodecError::ConnectionString(format!("unbalanced '}}' at offset {offset}"))
                })?;
            }
            c if c == separator && depth == 0 => {
                parts.push(&text[start..offset]);
                start = offset + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CodecError::ConnectionString("unbalanced '{'".to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn unwrap_braces(value: &str) -> &str {
    value
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(value)
}
