//! Resource lifecycle orchestration
//!
//! Provisions the per-run cloud and cluster resources in dependency order,
//! tracks the state of each one and tears down exactly what was created.

mod backend;
mod handle;
mod lifecycle;
mod plan;

use std::fmt;
use thiserror::Error;

use crate::portforward::TunnelError;

pub use backend::{CloudBackend, CreateOutcome, ResourceBackend};
pub use handle::{CreationState, FailedPhase, ResourceHandle, ResourceKind, ResourceParams, ResourceSpec};
pub use lifecycle::{OrchestratorOptions, ResourceLifecycleOrchestrator};
pub use plan::{firewall_rule_name, frontend_service_name, ProvisionPlan, Role};

/// A deletion that still failed after every retry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownFailure {
    pub kind: ResourceKind,
    pub name: String,
    pub reason: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.reason)
    }
}

/// Resource lifecycle errors
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("failed to create {kind} {name}: {reason}")]
    CreateFailed {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    #[error("{} resource(s) failed to tear down: {}", .failures.len(), join(.failures))]
    TeardownFailed { failures: Vec<TeardownFailure> },

    #[error("{kind} {name} already exists and is not owned by this run")]
    NameCollision { kind: ResourceKind, name: String },

    #[error("provisioning cancelled ({torn_down} torn down, {failed} teardown failure(s))")]
    Cancelled { torn_down: usize, failed: usize },

    #[error("{name}: cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: CreationState,
        to: CreationState,
    },

    #[error("port-forward {name} failed")]
    Tunnel {
        name: String,
        #[source]
        source: TunnelError,
    },
}

fn join(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
