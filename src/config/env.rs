//! Environment variable configuration
//!
//! Provides the environment override layer: `INTEROP_DRIVER_<KEY>=value`
//! sets flag `<key>` (lowercased) above the flagfile chain and below
//! command-line `--set` overrides.

use std::env;

use super::{ConfigError, ConfigSource, SourceOrigin};

/// Environment variable prefix
const ENV_PREFIX: &str = "INTEROP_DRIVER_";

/// Flag assignments taken from the process environment
#[derive(Clone, Debug, Default)]
pub struct EnvLayer {
    vars: Vec<(String, String)>,
}

impl EnvLayer {
    /// Load the layer from the current process environment
    pub fn load() -> Self {
        Self::from_vars(env::vars())
    }

    /// Build the layer from arbitrary variables (useful for testing)
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: Vec<(String, String)> = vars
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(ENV_PREFIX)
                    .filter(|key| !key.is_empty())
                    .map(|key| (key.to_ascii_lowercase(), value))
            })
            .collect();
        // env::vars() order is unspecified
        vars.sort();
        Self { vars }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(k, _)| k.as_str())
    }

    pub fn into_source(self) -> Result<ConfigSource, ConfigError> {
        ConfigSource::from_pairs(SourceOrigin::Environment, self.vars)
    }
}
