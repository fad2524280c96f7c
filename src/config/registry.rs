//! Flag registry
//!
//! The set of keys the consuming binaries recognise, with their kinds and
//! defaults. Keys outside the registry are unknown and rejected unless
//! tolerated via `--undefok`.

use std::collections::BTreeMap;

use super::ConfigValue;

/// Kind of a registered flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagKind {
    Str,
    Bool,
    Int { min: i64, max: i64 },
}

/// A registered flag
#[derive(Clone, Debug)]
pub struct FlagSpec {
    pub name: String,
    pub kind: FlagKind,
    pub default: Option<ConfigValue>,
    pub help: String,
}

impl FlagSpec {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FlagKind::Str,
            default: None,
            help: String::new(),
        }
    }

    /// Boolean flags default to false
    pub fn boolean(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FlagKind::Bool,
            default: Some(ConfigValue::Bool(false)),
            help: String::new(),
        }
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            kind: FlagKind::Int { min, max },
            default: None,
            help: String::new(),
        }
    }

    pub fn default_value(mut self, value: impl Into<ConfigValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Coerce a raw source value to this flag's kind
    pub fn coerce(&self, raw: &ConfigValue) -> Result<ConfigValue, String> {
        match (self.kind, raw) {
            (FlagKind::Bool, ConfigValue::Bool(b)) => Ok(ConfigValue::Bool(*b)),
            (FlagKind::Bool, ConfigValue::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ConfigValue::Bool(true)),
                "false" | "0" | "no" => Ok(ConfigValue::Bool(false)),
                _ => Err(format!("expected a boolean, got '{s}'")),
            },
            (FlagKind::Int { min, max }, ConfigValue::Str(s)) => {
                let value: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| format!("expected an integer, got '{s}'"))?;
                if value < min || value > max {
                    return Err(format!("{value} is outside the range [{min}, {max}]"));
                }
                Ok(ConfigValue::Int(value))
            }
            (FlagKind::Int { min, max }, ConfigValue::Int(value)) => {
                if *value < min || *value > max {
                    return Err(format!("{value} is outside the range [{min}, {max}]"));
                }
                Ok(ConfigValue::Int(*value))
            }
            (FlagKind::Str, ConfigValue::Str(s)) => Ok(ConfigValue::Str(s.clone())),
            (FlagKind::Str | FlagKind::Int { .. }, ConfigValue::Bool(_)) => {
                Err("flag requires a value (--key=value)".to_string())
            }
            (FlagKind::Str, ConfigValue::Int(i)) => Ok(ConfigValue::Str(i.to_string())),
            (FlagKind::Bool, ConfigValue::Int(i)) => Err(format!("expected a boolean, got '{i}'")),
        }
    }
}

/// Known flags of the consuming binaries
#[derive(Clone, Debug, Default)]
pub struct FlagRegistry {
    flags: BTreeMap<String, FlagSpec>,
}

impl FlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flag, replacing any previous flag of the same name
    pub fn with(mut self, spec: FlagSpec) -> Self {
        self.flags.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FlagSpec> {
        self.flags.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    /// The boolean flag a `--noflag` spelling negates, if any
    pub fn negated(&self, key: &str) -> Option<&FlagSpec> {
        if self.contains(key) {
            return None;
        }
        key.strip_prefix("no")
            .and_then(|name| self.get(name))
            .filter(|spec| spec.kind == FlagKind::Bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagSpec> {
        self.flags.values()
    }

    /// Defaults of every flag that declares one
    pub fn defaults(&self) -> BTreeMap<String, ConfigValue> {
        self.flags
            .values()
            .filter_map(|spec| spec.default.clone().map(|d| (spec.name.clone(), d)))
            .collect()
    }

    /// Flags understood by the interop driver and the test binaries it launches
    pub fn driver() -> Self {
        Self::new()
            .with(FlagSpec::string("project").help("GCP project to create resources in"))
            .with(
                FlagSpec::string("network")
                    .default_value("default")
                    .help("VPC network the test workloads run in"),
            )
            .with(FlagSpec::string("resource_prefix").help("Prefix of every resource name in the run"))
            .with(
                FlagSpec::string("resource_suffix")
                    .help("Suffix of every resource name; generated once per run when unset"),
            )
            .with(FlagSpec::string("kube_context").help("kubectl context of the target cluster"))
            .with(FlagSpec::string("server_name").default_value("psm-grpc-server"))
            .with(FlagSpec::string("client_name").default_value("psm-grpc-client"))
            .with(FlagSpec::int("server_port", 1, 65535).default_value(8080_i64))
            .with(FlagSpec::int("client_port", 1, 65535).default_value(8079_i64))
            .with(FlagSpec::string("server_image"))
            .with(FlagSpec::string("client_image"))
            .with(FlagSpec::string("xds_server_uri"))
            .with(
                FlagSpec::string("gcp_service_account")
                    .help("GCP service account bound to the workloads via workload identity"),
            )
            .with(FlagSpec::boolean("enable_workload_identity").default_value(true))
            .with(FlagSpec::boolean("ensure_firewall").help("Create the health-check firewall rule"))
            .with(FlagSpec::string("firewall_source_range").default_value("35.191.0.0/16,130.211.0.0/22"))
            .with(FlagSpec::string("firewall_allowed_ports").default_value("8080-8100"))
            .with(
                FlagSpec::boolean("debug_use_port_forwarding")
                    .help("Forward the test app ports to localhost"),
            )
            .with(
                FlagSpec::int("port_forward_timeout_secs", 1, 300)
                    .default_value(10_i64)
                    .help("Seconds to wait for a port-forward tunnel to accept connections"),
            )
            .with(FlagSpec::int("server_replica_count", 1, 999).default_value(1_i64))
            .with(FlagSpec::string("mode").default_value("default"))
            .with(FlagSpec::int("qps", 1, 100_000).default_value(25_i64))
            .with(
                FlagSpec::boolean("rollback_on_failure")
                    .help("Tear down already-created resources when provisioning fails"),
            )
            .with(FlagSpec::int("teardown_attempts", 1, 10).default_value(3_i64))
            .with(FlagSpec::int("teardown_retry_wait_secs", 0, 600).default_value(10_i64))
            .with(FlagSpec::string("test_binary").help("Test binary executed by `run`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_bool() {
        let spec = FlagSpec::boolean("ensure_firewall");
        assert_eq!(spec.coerce(&ConfigValue::Bool(true)), Ok(ConfigValue::Bool(true)));
        assert_eq!(spec.coerce(&"False".into()), Ok(ConfigValue::Bool(false)));
        assert_eq!(spec.coerce(&"1".into()), Ok(ConfigValue::Bool(true)));
        assert!(spec.coerce(&"maybe".into()).is_err());
    }

    #[test]
    fn test_coerce_int_bounds() {
        let spec = FlagSpec::int("server_replica_count", 1, 999);
        assert_eq!(spec.coerce(&"3".into()), Ok(ConfigValue::Int(3)));
        assert!(spec.coerce(&"0".into()).is_err());
        assert!(spec.coerce(&"1000".into()).is_err());
        assert!(spec.coerce(&"three".into()).is_err());
        assert!(spec.coerce(&ConfigValue::Bool(true)).is_err());
    }

    #[test]
    fn test_string_flag_requires_value() {
        let spec = FlagSpec::string("project");
        assert!(spec.coerce(&ConfigValue::Bool(true)).is_err());
        assert_eq!(spec.coerce(&"p".into()), Ok(ConfigValue::Str("p".into())));
    }

    #[test]
    fn test_negated_only_for_booleans() {
        let registry = FlagRegistry::driver();
        assert_eq!(
            registry.negated("noensure_firewall").map(|s| s.name.as_str()),
            Some("ensure_firewall")
        );
        assert!(registry.negated("noproject").is_none());
        assert!(registry.negated("network").is_none());
    }

    #[test]
    fn test_driver_defaults() {
        let defaults = FlagRegistry::driver().defaults();
        assert_eq!(defaults.get("server_port"), Some(&ConfigValue::Int(8080)));
        assert_eq!(defaults.get("ensure_firewall"), Some(&ConfigValue::Bool(false)));
        assert!(!defaults.contains_key("project"));
    }
}
