//! Provisioning plans
//!
//! A plan lists what a run needs, derived from the driver settings and the
//! run's namer. Optional resources that are not requested never appear in it.

use std::fmt;

use super::{ResourceKind, ResourceParams, ResourceSpec};
use crate::config::{DriverSettings, TestMode};
use crate::naming::ResourceNamer;
use crate::portforward::TunnelSpec;

/// Test app role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// `<prefix>-<role>-<suffix>`
    pub fn namespace(&self, namer: &ResourceNamer) -> String {
        namer.name(self.as_str())
    }

    /// Kubernetes service account and deployment name of the role's app
    pub fn app_name<'a>(&self, settings: &'a DriverSettings) -> &'a str {
        match self {
            Role::Server => &settings.server_name,
            Role::Client => &settings.client_name,
        }
    }

    pub fn port(&self, settings: &DriverSettings) -> u16 {
        match self {
            Role::Server => settings.server_port,
            Role::Client => settings.client_port,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gamma frontend service name, `<prefix>-<suffix>`
pub fn frontend_service_name(namer: &ResourceNamer) -> String {
    namer.base_name()
}

pub fn firewall_rule_name(namer: &ResourceNamer) -> String {
    namer.name("allow-health-checks")
}

/// Ordered resources of a run
#[derive(Clone, Debug, Default)]
pub struct ProvisionPlan {
    specs: Vec<ResourceSpec>,
}

impl ProvisionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: ResourceSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn from_settings(settings: &DriverSettings, namer: &ResourceNamer) -> Self {
        let roles = [Role::Server, Role::Client];
        let mut plan = Self::new();

        if settings.uses_workload_identity() {
            if let (Some(project), Some(account)) = (&settings.project, &settings.gcp_service_account) {
                for role in roles {
                    let namespace = role.namespace(namer);
                    let app = role.app_name(settings);
                    plan = plan.with(ResourceSpec::new(
                        format!("{namespace}/{app}"),
                        ResourceParams::SecretAccess {
                            project: project.clone(),
                            service_account: account.clone(),
                            member: format!("serviceAccount:{project}.svc.id.goog[{namespace}/{app}]"),
                        },
                    ));
                }
            }
        }

        for role in roles {
            let namespace = role.namespace(namer);
            plan = plan.with(ResourceSpec::new(
                namespace.clone(),
                ResourceParams::ClusterBinding {
                    context: settings.kube_context.clone(),
                    namespace,
                },
            ));
        }

        if settings.ensure_firewall {
            if let Some(project) = &settings.project {
                plan = plan.with(ResourceSpec::new(
                    firewall_rule_name(namer),
                    ResourceParams::FirewallRule {
                        project: project.clone(),
                        network: settings.network.clone(),
                        source_ranges: settings.firewall_source_ranges.clone(),
                        allowed_ports: settings.firewall_allowed_ports.clone(),
                    },
                ));
            }
        }

        if settings.port_forwarding {
            for role in roles {
                let port = role.port(settings);
                let target = match (role, settings.mode) {
                    (Role::Server, TestMode::Gamma) => {
                        format!("service/{}", frontend_service_name(namer))
                    }
                    _ => format!("deployment/{}", role.app_name(settings)),
                };
                let tunnel = TunnelSpec::new(port, port, role.namespace(namer), target)
                    .context(settings.kube_context.clone());
                plan = plan.with(ResourceSpec::new(
                    namer.name(&format!("{role}-port-forward")),
                    ResourceParams::PortForward(tunnel),
                ));
            }
        }

        plan
    }

    /// Specs grouped by kind, earliest stage first; empty stages are omitted
    pub fn stages(&self) -> Vec<(ResourceKind, Vec<&ResourceSpec>)> {
        let mut stages = Vec::new();
        for kind in ResourceKind::all() {
            let specs: Vec<&ResourceSpec> = self.specs.iter().filter(|s| s.kind() == kind).collect();
            if !specs.is_empty() {
                stages.push((kind, specs));
            }
        }
        stages
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
}
