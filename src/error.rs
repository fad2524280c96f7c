//! Top-level driver errors and exit codes

use std::process::ExitCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::ExecError;
use crate::naming::NamingError;
use crate::orchestrator::ResourceError;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_PROVISION: u8 = 3;
pub const EXIT_TEST_FAILED: u8 = 4;
pub const EXIT_TEARDOWN: u8 = 5;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("provisioning failed")]
    Provision(#[source] ResourceError),

    #[error("test binary failed{}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    TestFailed { exit_code: Option<i32> },

    #[error(transparent)]
    Exec(ExecError),

    #[error("teardown incomplete")]
    Teardown(#[source] ResourceError),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ResourceError> for DriverError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Cancelled { .. } => DriverError::Cancelled,
            ResourceError::TeardownFailed { .. } => DriverError::Teardown(err),
            other => DriverError::Provision(other),
        }
    }
}

impl From<ExecError> for DriverError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled => DriverError::Cancelled,
            other => DriverError::Exec(other),
        }
    }
}

impl DriverError {
    pub fn exit_code(&self) -> u8 {
        match self {
            DriverError::Config(_) | DriverError::Naming(_) => EXIT_CONFIG,
            DriverError::Provision(_) | DriverError::Other(_) => EXIT_PROVISION,
            DriverError::TestFailed { .. } | DriverError::Exec(_) => EXIT_TEST_FAILED,
            DriverError::Teardown(_) => EXIT_TEARDOWN,
            DriverError::Cancelled => EXIT_CANCELLED,
        }
    }
}

impl From<&DriverError> for ExitCode {
    fn from(err: &DriverError) -> Self {
        ExitCode::from(err.exit_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes_are_distinct() {
        let config: DriverError = ConfigError::CyclicInclude {
            chain: vec![PathBuf::from("a.cfg"), PathBuf::from("a.cfg")],
        }
        .into();
        let provision: DriverError = ResourceError::CreateFailed {
            kind: crate::orchestrator::ResourceKind::FirewallRule,
            name: "fw".to_string(),
            reason: "denied".to_string(),
        }
        .into();
        let test = DriverError::TestFailed { exit_code: Some(1) };
        let teardown: DriverError = ResourceError::TeardownFailed { failures: vec![] }.into();
        let cancelled: DriverError = ResourceError::Cancelled { torn_down: 2, failed: 0 }.into();

        assert_eq!(config.exit_code(), EXIT_CONFIG);
        assert_eq!(provision.exit_code(), EXIT_PROVISION);
        assert_eq!(test.exit_code(), EXIT_TEST_FAILED);
        assert_eq!(teardown.exit_code(), EXIT_TEARDOWN);
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(DriverError::from(ExecError::Cancelled).exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_test_failure_message() {
        assert_eq!(
            DriverError::TestFailed { exit_code: Some(3) }.to_string(),
            "test binary failed with exit code 3"
        );
        assert_eq!(
            DriverError::TestFailed { exit_code: None }.to_string(),
            "test binary failed"
        );
    }
}
