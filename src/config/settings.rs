//! Typed driver settings
//!
//! The driver reads its own knobs through [`DriverSettings`] instead of
//! looking flags up ad hoc; downstream binaries still get the whole
//! [`EffectiveConfig`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{ConfigError, EffectiveConfig};
use crate::naming::{NameTemplate, SuffixPolicy};

/// Deployment flavour of the test apps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TestMode {
    #[default]
    Default,
    Secure,
    Gamma,
}

impl FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(TestMode::Default),
            "secure" => Ok(TestMode::Secure),
            "gamma" => Ok(TestMode::Gamma),
            other => Err(format!("unknown mode '{other}', expected default, secure or gamma")),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestMode::Default => write!(f, "default"),
            TestMode::Secure => write!(f, "secure"),
            TestMode::Gamma => write!(f, "gamma"),
        }
    }
}

/// Settings the driver itself acts on
#[derive(Clone, Debug)]
pub struct DriverSettings {
    pub project: Option<String>,
    pub network: String,
    pub resource_prefix: String,
    pub resource_suffix: SuffixPolicy,
    pub kube_context: Option<String>,
    pub server_name: String,
    pub client_name: String,
    pub server_port: u16,
    pub client_port: u16,
    pub gcp_service_account: Option<String>,
    pub enable_workload_identity: bool,
    pub ensure_firewall: bool,
    pub firewall_source_ranges: Vec<String>,
    pub firewall_allowed_ports: Vec<String>,
    pub port_forwarding: bool,
    pub port_forward_timeout: Duration,
    pub mode: TestMode,
    pub rollback_on_failure: bool,
    pub teardown_attempts: u32,
    pub teardown_retry_wait: Duration,
    pub test_binary: Option<PathBuf>,
}

impl DriverSettings {
    pub fn from_config(config: &EffectiveConfig) -> Result<Self, ConfigError> {
        let resource_prefix = config
            .get_non_empty("resource_prefix")
            .ok_or_else(|| ConfigError::MissingRequired("resource_prefix".to_string()))?;

        let mode = config
            .get_string("mode")
            .unwrap_or_default()
            .parse::<TestMode>()
            .map_err(|reason| ConfigError::InvalidValue {
                key: "mode".to_string(),
                reason,
            })?;

        let settings = Self {
            project: config.get_non_empty("project"),
            network: config
                .get_non_empty("network")
                .unwrap_or_else(|| "default".to_string()),
            resource_prefix,
            resource_suffix: SuffixPolicy::from_option(config.get_string("resource_suffix").as_deref()),
            kube_context: config.get_non_empty("kube_context"),
            server_name: required_string(config, "server_name")?,
            client_name: required_string(config, "client_name")?,
            server_port: int_as(config, "server_port")?,
            client_port: int_as(config, "client_port")?,
            gcp_service_account: config.get_non_empty("gcp_service_account"),
            enable_workload_identity: config.get_bool("enable_workload_identity"),
            ensure_firewall: config.get_bool("ensure_firewall"),
            firewall_source_ranges: list(config, "firewall_source_range"),
            firewall_allowed_ports: list(config, "firewall_allowed_ports"),
            port_forwarding: config.get_bool("debug_use_port_forwarding"),
            port_forward_timeout: Duration::from_secs(int_as(config, "port_forward_timeout_secs")?),
            mode,
            rollback_on_failure: config.get_bool("rollback_on_failure"),
            teardown_attempts: int_as(config, "teardown_attempts")?,
            teardown_retry_wait: Duration::from_secs(int_as(config, "teardown_retry_wait_secs")?),
            test_binary: config.get_non_empty("test_binary").map(PathBuf::from),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.project.is_none() && (self.uses_workload_identity() || self.ensure_firewall) {
            return Err(ConfigError::MissingRequired("project".to_string()));
        }
        if self.port_forwarding && self.server_port == self.client_port {
            return Err(ConfigError::InvalidValue {
                key: "client_port".to_string(),
                reason: format!(
                    "port forwarding needs distinct local ports, server_port is also {}",
                    self.server_port
                ),
            });
        }
        if self.ensure_firewall && self.firewall_allowed_ports.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "firewall_allowed_ports".to_string(),
                reason: "at least one port or range is required".to_string(),
            });
        }
        Ok(())
    }

    /// Workload identity bindings are created only with a service account
    pub fn uses_workload_identity(&self) -> bool {
        self.enable_workload_identity && self.gcp_service_account.is_some()
    }

    pub fn name_template(&self) -> NameTemplate {
        NameTemplate::new(self.resource_prefix.clone(), self.resource_suffix.clone())
    }
}

fn required_string(config: &EffectiveConfig, key: &str) -> Result<String, ConfigError> {
    config
        .get_non_empty(key)
        .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

fn int_as<T: TryFrom<i64>>(config: &EffectiveConfig, key: &str) -> Result<T, ConfigError> {
    let value = config
        .get_int(key)
        .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))?;
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{value} is out of range"),
    })
}

fn list(config: &EffectiveConfig, key: &str) -> Vec<String> {
    config
        .get_string(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, ConfigSource, FlagRegistry, SourceOrigin};

    fn resolve(text: &str) -> Result<DriverSettings, ConfigError> {
        let source = ConfigSource::parse(SourceOrigin::CommandLine, text)?;
        let config = ConfigResolver::new(FlagRegistry::driver()).resolve_source(&source)?;
        DriverSettings::from_config(&config)
    }

    #[test]
    fn test_defaults() {
        let settings = resolve("--resource_prefix=alice-psm").unwrap();

        assert_eq!(settings.network, "default");
        assert_eq!(settings.server_port, 8080);
        assert_eq!(settings.client_port, 8079);
        assert_eq!(settings.server_name, "psm-grpc-server");
        assert_eq!(settings.resource_suffix, SuffixPolicy::Random);
        assert_eq!(settings.mode, TestMode::Default);
        assert_eq!(settings.teardown_attempts, 3);
        assert_eq!(settings.teardown_retry_wait, Duration::from_secs(10));
        assert_eq!(settings.firewall_source_ranges.len(), 2);
        assert!(settings.enable_workload_identity);
        assert!(!settings.uses_workload_identity());
        assert!(!settings.ensure_firewall);
        assert!(!settings.port_forwarding);
        assert_eq!(settings.port_forward_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_prefix_is_required() {
        let err = resolve("--server_port=50051").unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(key) if key == "resource_prefix"));
    }

    #[test]
    fn test_project_required_for_cloud_resources() {
        let err = resolve("--resource_prefix=a\n--ensure_firewall").unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(key) if key == "project"));

        let err = resolve("--resource_prefix=a\n--gcp_service_account=sa@p.iam.gserviceaccount.com")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(key) if key == "project"));

        let ok = resolve("--resource_prefix=a\n--gcp_service_account=sa@p\n--noenable_workload_identity");
        assert!(ok.is_ok());
    }

    #[test]
    fn test_mode_and_suffix() {
        let settings = resolve("--resource_prefix=a\n--mode=GAMMA\n--resource_suffix=r1").unwrap();
        assert_eq!(settings.mode, TestMode::Gamma);
        assert_eq!(settings.resource_suffix, SuffixPolicy::Fixed("r1".to_string()));

        let err = resolve("--resource_prefix=a\n--mode=mesh").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "mode"));
    }

    #[test]
    fn test_port_forwarding_needs_distinct_ports() {
        let err = resolve(
            "--resource_prefix=a\n--debug_use_port_forwarding\n--server_port=9000\n--client_port=9000",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "client_port"));
    }

    #[test]
    fn test_bundled_gamma_flagfile() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/gamma.cfg");
        let config = ConfigResolver::new(FlagRegistry::driver())
            .resolve(Some(&root))
            .unwrap();
        let settings = DriverSettings::from_config(&config).unwrap();

        assert_eq!(settings.mode, TestMode::Gamma);
        assert_eq!(settings.resource_prefix, "dev-psm");
        assert!(settings.uses_workload_identity());
        assert!(settings.port_forwarding);
        assert!(!settings.ensure_firewall);
        assert!(config.tolerated().any(|key| key == "xds_creds"));
        assert_eq!(config.get_string("xds_creds").as_deref(), Some("insecure"));
    }
}
