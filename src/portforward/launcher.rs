//! Port-forward process launchers

use std::fmt;
use tokio::process::Command;

/// What to forward: a local port to a port of a workload in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote_port: u16,
    pub namespace: String,
    /// kubectl resource reference, e.g. `deployment/psm-grpc-server`
    pub target: String,
    pub context: Option<String>,
}

impl TunnelSpec {
    pub fn new(
        local_port: u16,
        remote_port: u16,
        namespace: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            local_port,
            remote_port,
            namespace: namespace.into(),
            target: target.into(),
            context: None,
        }
    }

    pub fn context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "localhost:{} -> {}/{}:{}",
            self.local_port, self.namespace, self.target, self.remote_port
        )
    }
}

/// Builds the process backing a tunnel
pub trait TunnelLauncher: Send + Sync {
    fn command(&self, spec: &TunnelSpec) -> Command;

    /// Stdout line marking the tunnel as ready; `None` means ready on spawn
    fn ready_marker(&self) -> Option<&str> {
        Some("Forwarding from")
    }
}

/// Launches `kubectl port-forward`
#[derive(Clone, Debug)]
pub struct KubectlLauncher {
    kubectl: String,
}

impl Default for KubectlLauncher {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
        }
    }
}

impl KubectlLauncher {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    fn args(&self, spec: &TunnelSpec) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref context) = spec.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend([
            "port-forward".to_string(),
            "--namespace".to_string(),
            spec.namespace.clone(),
            "--address".to_string(),
            "127.0.0.1".to_string(),
            spec.target.clone(),
            format!("{}:{}", spec.local_port, spec.remote_port),
        ]);
        args
    }
}

impl TunnelLauncher for KubectlLauncher {
    fn command(&self, spec: &TunnelSpec) -> Command {
        let mut command = Command::new(&self.kubectl);
        command.args(self.args(spec));
        command
    }
}
