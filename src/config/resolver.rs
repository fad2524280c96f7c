//! Layered configuration resolution
//!
//! Merges a flagfile include chain plus override layers into one immutable
//! [`EffectiveConfig`]. Included (parent) sources are applied before the
//! including source's own entries, so the most-derived source wins for any
//! key it sets. Override layers are applied last, in the order given.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{ConfigEntry, ConfigError, ConfigSource, ConfigValue, FlagRegistry, SourceOrigin};

/// Resolved configuration for one run
#[derive(Clone, Debug, Serialize)]
pub struct EffectiveConfig {
    entries: BTreeMap<String, ConfigEntry>,
    tolerated: BTreeSet<String>,
    #[serde(skip)]
    defaults: BTreeMap<String, ConfigValue>,
}

impl EffectiveConfig {
    /// The explicitly set entry for a key
    pub fn get(&self, key: &str) -> Option<&ConfigEntry> {
        self.entries.get(key)
    }

    /// Explicit value, falling back to the registered default
    pub fn value(&self, key: &str) -> Option<&ConfigValue> {
        self.entries
            .get(key)
            .map(|e| &e.value)
            .or_else(|| self.defaults.get(key))
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.value(key).map(ToString::to_string)
    }

    /// Non-empty string value
    pub fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get_string(key).filter(|s| !s.trim().is_empty())
    }

    /// Boolean flags read as false unless set
    pub fn get_bool(&self, key: &str) -> bool {
        self.value(key).and_then(ConfigValue::as_bool).unwrap_or(false)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(ConfigValue::as_int)
    }

    pub fn tolerated(&self) -> impl Iterator<Item = &str> {
        self.tolerated.iter().map(String::as_str)
    }

    /// Flat key -> value view of the explicitly set entries
    pub fn flat(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.to_string()))
            .collect()
    }

    /// Render explicit entries back to flags for a downstream binary
    ///
    /// Tolerated keys are listed in a trailing `--undefok=` so the consumer
    /// accepts them even when it does not define them.
    pub fn to_flag_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .entries
            .iter()
            .map(|(key, entry)| match entry.value {
                ConfigValue::Bool(true) => format!("--{key}"),
                ConfigValue::Bool(false) => format!("--no{key}"),
                ref value => format!("--{key}={value}"),
            })
            .collect();

        if !self.tolerated.is_empty() {
            let keys: Vec<&str> = self.tolerated().collect();
            args.push(format!("--undefok={}", keys.join(",")));
        }
        args
    }

    /// One line per registered flag with its value, where it came from and
    /// its help text, followed by the tolerated unknown keys that are set
    pub fn explain(&self, registry: &FlagRegistry) -> Vec<String> {
        let mut lines = Vec::new();

        for spec in registry.iter() {
            let (value, from) = match self.get(&spec.name) {
                Some(entry) => (entry.value.to_string(), entry.location()),
                None => match self.defaults.get(&spec.name) {
                    Some(default) => (default.to_string(), "default".to_string()),
                    None => ("<unset>".to_string(), "default".to_string()),
                },
            };
            let mut line = format!("--{}={}  [{}]", spec.name, value, from);
            if !spec.help.is_empty() {
                line.push_str(&format!("  {}", spec.help));
            }
            lines.push(line);
        }

        for (key, entry) in &self.entries {
            if registry.get(key).is_none() {
                lines.push(format!(
                    "--{}={}  [{}]  passed through via --undefok",
                    key,
                    entry.value,
                    entry.location()
                ));
            }
        }
        lines
    }
}

/// Entries in application order plus every tolerated key seen
#[derive(Default)]
struct Merge {
    entries: Vec<ConfigEntry>,
    tolerated: BTreeSet<String>,
}

/// Merges configuration sources into an [`EffectiveConfig`]
pub struct ConfigResolver {
    registry: FlagRegistry,
    overrides: Vec<ConfigSource>,
}

impl ConfigResolver {
    pub fn new(registry: FlagRegistry) -> Self {
        Self {
            registry,
            overrides: Vec::new(),
        }
    }

    /// Add an override layer applied after the flagfile chain
    pub fn with_override(mut self, source: ConfigSource) -> Self {
        self.overrides.push(source);
        self
    }

    /// Resolve the chain rooted at `root` (if any) plus the override layers
    pub fn resolve(&self, root: Option<&Path>) -> Result<EffectiveConfig, ConfigError> {
        match root {
            Some(root) => self.resolve_source(&ConfigSource::load(canonical(root)?)?),
            None => self.with_overrides(Merge::default()),
        }
    }

    /// Resolve an already-loaded root source
    pub fn resolve_source(&self, root: &ConfigSource) -> Result<EffectiveConfig, ConfigError> {
        let mut merge = Merge::default();
        let mut stack = Vec::new();
        if let SourceOrigin::File(path) = root.origin() {
            stack.push(canonical(path)?);
        }
        self.apply(root, &mut stack, &mut merge)?;
        self.with_overrides(merge)
    }

    fn with_overrides(&self, mut merge: Merge) -> Result<EffectiveConfig, ConfigError> {
        for source in &self.overrides {
            let mut stack = Vec::new();
            self.apply(source, &mut stack, &mut merge)?;
        }
        self.finish(merge)
    }

    /// Apply `source` with its includes first; `stack` holds the current include path
    fn apply(
        &self,
        source: &ConfigSource,
        stack: &mut Vec<PathBuf>,
        merge: &mut Merge,
    ) -> Result<(), ConfigError> {
        for include in source.includes() {
            let path = canonical(&include_path(source.origin().base_dir(), include))?;

            if stack.contains(&path) {
                let mut chain = stack.clone();
                chain.push(path);
                return Err(ConfigError::CyclicInclude { chain });
            }

            debug!("Including flagfile {}", path.display());
            let parent = ConfigSource::load(&path)?;
            stack.push(path);
            self.apply(&parent, stack, merge)?;
            stack.pop();
        }

        merge.entries.extend(source.entries().cloned());
        merge
            .tolerated
            .extend(source.tolerated().map(String::from));
        Ok(())
    }

    /// Fold `--noflag` into `flag = false` so negations override by key
    ///
    /// Applies to registered boolean flags and to unknown flags listed in
    /// `--undefok`.
    fn normalize(&self, entry: ConfigEntry, tolerated: &BTreeSet<String>) -> ConfigEntry {
        if entry.value != ConfigValue::Bool(true) {
            return entry;
        }
        let negated = match self.registry.negated(&entry.key) {
            Some(spec) => Some(spec.name.clone()),
            None if self.registry.get(&entry.key).is_none() && !tolerated.contains(&entry.key) => entry
                .key
                .strip_prefix("no")
                .filter(|name| tolerated.contains(*name) && self.registry.get(name).is_none())
                .map(String::from),
            None => None,
        };
        match negated {
            Some(key) => ConfigEntry {
                key,
                value: ConfigValue::Bool(false),
                ..entry
            },
            None => entry,
        }
    }

    fn finish(&self, merge: Merge) -> Result<EffectiveConfig, ConfigError> {
        let Merge {
            entries: applied,
            tolerated,
        } = merge;

        let mut entries: BTreeMap<String, ConfigEntry> = BTreeMap::new();
        for entry in applied {
            let entry = self.normalize(entry, &tolerated);
            if let Some(previous) = entries.get(&entry.key) {
                debug!(
                    "{} overrides '{}' previously set in {}",
                    entry.location(),
                    entry.key,
                    previous.location()
                );
            }
            entries.insert(entry.key.clone(), entry);
        }

        for (key, entry) in entries.iter_mut() {
            match self.registry.get(key) {
                Some(spec) => {
                    entry.value =
                        spec.coerce(&entry.value)
                            .map_err(|reason| ConfigError::InvalidValue {
                                key: key.clone(),
                                reason: format!("{reason} (set in {})", entry.location()),
                            })?;
                }
                None if tolerated.contains(key) => {
                    warn!("Passing through unknown flag '{}' listed in --undefok", key);
                }
                None => {
                    return Err(ConfigError::UnknownKey {
                        key: key.clone(),
                        origin: entry.location(),
                    });
                }
            }
        }

        Ok(EffectiveConfig {
            entries,
            tolerated,
            defaults: self.registry.defaults(),
        })
    }
}

fn include_path(base_dir: Option<&Path>, include: &Path) -> PathBuf {
    let expanded = expand_home(include);
    match base_dir {
        Some(dir) if expanded.is_relative() => dir.join(expanded),
        _ => expanded,
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn canonical(path: &Path) -> Result<PathBuf, ConfigError> {
    path.canonicalize().map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
