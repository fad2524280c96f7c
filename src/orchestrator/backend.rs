//! Backends that create and delete concrete resources

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ResourceParams, ResourceSpec};
use crate::k8s::K8sClient;

const WORKLOAD_IDENTITY_ROLE: &str = "roles/iam.workloadIdentityUser";
const GCLOUD: &str = "gcloud";

/// How a resource came to be present
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// It already existed under the same name
    Adopted,
}

/// Creates and deletes cloud and cluster resources
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    async fn create(&self, spec: &ResourceSpec) -> Result<CreateOutcome>;

    /// Deleting a resource that does not exist succeeds
    async fn delete(&self, spec: &ResourceSpec) -> Result<()>;
}

/// Backend driving the `gcloud` CLI and the Kubernetes API
pub struct CloudBackend {
    k8s: K8sClient,
}

impl CloudBackend {
    pub fn new(k8s: K8sClient) -> Self {
        Self { k8s }
    }

    /// The child is killed if the returned future is dropped
    async fn run(&self, args: &[String]) -> Result<Output> {
        debug!("{} {}", GCLOUD, args.join(" "));
        Command::new(GCLOUD)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", GCLOUD))
    }

    async fn firewall_exists(&self, name: &str, project: &str) -> Result<bool> {
        let output = self.run(&firewall_describe_args(name, project)).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl ResourceBackend for CloudBackend {
    async fn create(&self, spec: &ResourceSpec) -> Result<CreateOutcome> {
        match &spec.params {
            ResourceParams::SecretAccess {
                project,
                service_account,
                member,
            } => {
                let args = iam_binding_args("add-iam-policy-binding", project, service_account, member);
                let output = self.run(&args).await?;
                if !output.status.success() {
                    bail!("add-iam-policy-binding failed: {}", stderr(&output));
                }
                info!("Granted {} to {}", WORKLOAD_IDENTITY_ROLE, member);
                Ok(CreateOutcome::Created)
            }
            ResourceParams::ClusterBinding { namespace, .. } => {
                if self.k8s.create_namespace(namespace).await? {
                    Ok(CreateOutcome::Created)
                } else {
                    Ok(CreateOutcome::Adopted)
                }
            }
            ResourceParams::FirewallRule {
                project,
                network,
                source_ranges,
                allowed_ports,
            } => {
                if self.firewall_exists(&spec.name, project).await? {
                    info!("Firewall rule {} already exists, reusing it", spec.name);
                    return Ok(CreateOutcome::Adopted);
                }
                let args = firewall_create_args(&spec.name, project, network, source_ranges, allowed_ports);
                let output = self.run(&args).await?;
                if !output.status.success() {
                    let stderr = stderr(&output);
                    // Lost a race with a concurrent run ensuring the same rule
                    if stderr.contains("already exists") {
                        return Ok(CreateOutcome::Adopted);
                    }
                    bail!("firewall-rules create failed: {}", stderr);
                }
                info!("Created firewall rule {}", spec.name);
                Ok(CreateOutcome::Created)
            }
            ResourceParams::PortForward(_) => {
                bail!("port-forward tunnels are not managed by the cloud backend")
            }
        }
    }

    async fn delete(&self, spec: &ResourceSpec) -> Result<()> {
        match &spec.params {
            ResourceParams::SecretAccess {
                project,
                service_account,
                member,
            } => {
                let args = iam_binding_args("remove-iam-policy-binding", project, service_account, member);
                let output = self.run(&args).await?;
                if !output.status.success() && !is_not_found(&stderr(&output)) {
                    bail!("remove-iam-policy-binding failed: {}", stderr(&output));
                }
                Ok(())
            }
            ResourceParams::ClusterBinding { namespace, .. } => {
                self.k8s.delete_namespace(namespace).await?;
                Ok(())
            }
            ResourceParams::FirewallRule { project, .. } => {
                let output = self.run(&firewall_delete_args(&spec.name, project)).await?;
                if !output.status.success() && !is_not_found(&stderr(&output)) {
                    bail!("firewall-rules delete failed: {}", stderr(&output));
                }
                Ok(())
            }
            ResourceParams::PortForward(_) => Ok(()),
        }
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found") || stderr.contains("NOT_FOUND")
}

fn iam_binding_args(verb: &str, project: &str, service_account: &str, member: &str) -> Vec<String> {
    [
        "iam",
        "service-accounts",
        verb,
        service_account,
        "--project",
        project,
        "--role",
        WORKLOAD_IDENTITY_ROLE,
        "--member",
        member,
        "--quiet",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn firewall_describe_args(name: &str, project: &str) -> Vec<String> {
    [
        "compute",
        "firewall-rules",
        "describe",
        name,
        "--project",
        project,
        "--format=value(name)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn firewall_create_args(
    name: &str,
    project: &str,
    network: &str,
    source_ranges: &[String],
    allowed_ports: &[String],
) -> Vec<String> {
    let rules = allowed_ports
        .iter()
        .map(|p| format!("tcp:{p}"))
        .collect::<Vec<_>>()
        .join(",");
    vec![
        "compute".to_string(),
        "firewall-rules".to_string(),
        "create".to_string(),
        name.to_string(),
        "--project".to_string(),
        project.to_string(),
        "--network".to_string(),
        network.to_string(),
        "--direction=INGRESS".to_string(),
        "--action=ALLOW".to_string(),
        format!("--source-ranges={}", source_ranges.join(",")),
        format!("--rules={rules}"),
        "--quiet".to_string(),
    ]
}

fn firewall_delete_args(name: &str, project: &str) -> Vec<String> {
    ["compute", "firewall-rules", "delete", name, "--project", project, "--quiet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
