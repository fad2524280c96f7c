//! Flagfile sources
//!
//! A source is one flagfile or override layer. Lines are parsed into ordered
//! directives: flag assignments, `--flagfile=` includes and `--undefok=` lists.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use super::ConfigError;

const INCLUDE_KEY: &str = "flagfile";
const UNDEFOK_KEY: &str = "undefok";

/// Where a source's entries came from
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    File(PathBuf),
    Environment,
    CommandLine,
}

impl SourceOrigin {
    /// Directory relative includes are resolved against, if any
    pub fn base_dir(&self) -> Option<&Path> {
        match self {
            SourceOrigin::File(path) => path.parent(),
            _ => None,
        }
    }
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOrigin::File(path) => write!(f, "{}", path.display()),
            SourceOrigin::Environment => write!(f, "environment"),
            SourceOrigin::CommandLine => write!(f, "command line"),
        }
    }
}

/// A flag value
///
/// Sources only produce `Str` (from `--key=value`) and `Bool(true)` (from a
/// bare `--key`); the resolver coerces them to the registered kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

/// A single `key = value` assignment and where it was made
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: ConfigValue,
    pub origin: SourceOrigin,
    pub line: usize,
}

impl ConfigEntry {
    /// `origin:line` for diagnostics
    pub fn location(&self) -> String {
        format!("{}:{}", self.origin, self.line)
    }
}

/// One parsed line of a source
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    Set(ConfigEntry),
    Include { path: PathBuf, line: usize },
    Undefok(Vec<String>),
}

/// One configuration layer
#[derive(Clone, Debug)]
pub struct ConfigSource {
    origin: SourceOrigin,
    directives: Vec<Directive>,
}

impl ConfigSource {
    /// Read and parse a flagfile from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(SourceOrigin::File(path.to_path_buf()), &content)
    }

    /// Parse flagfile text
    pub fn parse(origin: SourceOrigin, text: &str) -> Result<Self, ConfigError> {
        let mut directives = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            directives.push(parse_line(&origin, idx + 1, line)?);
        }

        Ok(Self { origin, directives })
    }

    /// Build a source from `(key, value)` pairs, e.g. `--set` arguments
    pub fn from_pairs<I, K, V>(origin: SourceOrigin, pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut directives = Vec::new();
        for (idx, (key, value)) in pairs.into_iter().enumerate() {
            let line = format!("--{}={}", key.as_ref(), value.as_ref());
            directives.push(parse_line(&origin, idx + 1, &line)?);
        }
        Ok(Self { origin, directives })
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    /// Flag assignments in file order
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Set(entry) => Some(entry),
            _ => None,
        })
    }

    /// Included flagfile paths, as written
    pub fn includes(&self) -> impl Iterator<Item = &Path> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Include { path, .. } => Some(path.as_path()),
            _ => None,
        })
    }

    /// Keys this source marks as tolerated when unknown
    pub fn tolerated(&self) -> impl Iterator<Item = &str> {
        self.directives
            .iter()
            .filter_map(|d| match d {
                Directive::Undefok(keys) => Some(keys),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
    }
}

fn parse_line(origin: &SourceOrigin, line_no: usize, line: &str) -> Result<Directive, ConfigError> {
    let malformed = || ConfigError::MalformedLine {
        origin: origin.to_string(),
        line: line_no,
        content: line.to_string(),
    };

    let body = line.strip_prefix("--").ok_or_else(malformed)?;
    let (key, value) = match body.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (body, None),
    };

    if key.is_empty() || key.starts_with('-') || key.chars().any(char::is_whitespace) {
        return Err(malformed());
    }

    match (key, value) {
        (INCLUDE_KEY, Some(path)) if !path.trim().is_empty() => Ok(Directive::Include {
            path: PathBuf::from(path.trim()),
            line: line_no,
        }),
        (INCLUDE_KEY, _) => Err(malformed()),
        (UNDEFOK_KEY, Some(list)) => Ok(Directive::Undefok(
            list.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
        )),
        (UNDEFOK_KEY, None) => Err(malformed()),
        (key, value) => Ok(Directive::Set(ConfigEntry {
            key: key.to_string(),
            value: value.map_or(ConfigValue::Bool(true), |v| ConfigValue::Str(v.to_string())),
            origin: origin.clone(),
            line: line_no,
        })),
    }
}
