//! Configuration module
//!
//! Flagfile parsing, layered resolution into an immutable [`EffectiveConfig`],
//! and the typed [`DriverSettings`] view consumed by the rest of the driver.

mod env;
mod registry;
mod resolver;
mod settings;
mod source;

use std::path::PathBuf;
use thiserror::Error;

use crate::naming::NamingError;

use source::{ConfigEntry, ConfigValue};

pub use env::EnvLayer;
pub use registry::FlagRegistry;
pub use resolver::{ConfigResolver, EffectiveConfig};
pub use settings::{DriverSettings, TestMode};
pub use source::{ConfigSource, SourceOrigin};

/// Errors raised while reading, merging or validating configuration.
///
/// Any of these aborts a run before a single resource is touched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cyclic flagfile include: {}", format_chain(.chain))]
    CyclicInclude { chain: Vec<PathBuf> },

    #[error("unknown flag '{key}' (set in {origin}); list it in --undefok to tolerate it")]
    UnknownKey { key: String, origin: String },

    #[error("malformed line {line} in {origin}: '{content}'")]
    MalformedLine {
        origin: String,
        line: usize,
        content: String,
    },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required flag '{0}'")]
    MissingRequired(String),

    #[error("failed to read flagfile {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Naming(#[from] NamingError),
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
