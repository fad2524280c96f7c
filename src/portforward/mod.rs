//! Local port-forward tunnels
//!
//! Tunnels expose cluster-internal test app ports on localhost for debugging.
//! Each tunnel is a supervised child process spawned with kill-on-drop, so
//! dropping the [`PortForwardManager`] on any exit path stops every tunnel.

mod launcher;
mod manager;

use std::time::Duration;
use thiserror::Error;

pub use launcher::{KubectlLauncher, TunnelLauncher, TunnelSpec};
pub use manager::PortForwardManager;

/// Port-forward errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("local port {port} is already forwarded ({existing})")]
    PortInUse { port: u16, existing: String },

    #[error("failed to spawn port-forward {spec}")]
    Spawn {
        spec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port-forward on local port {port} exited ({status})")]
    ProcessExited { port: u16, status: String },

    #[error("port-forward on local port {port} not ready after {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },

    #[error("failed to read port-forward output on local port {port}")]
    Io {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl TunnelError {
    /// Local port the error is about
    pub fn port(&self) -> Option<u16> {
        match self {
            TunnelError::PortInUse { port, .. }
            | TunnelError::ProcessExited { port, .. }
            | TunnelError::StartupTimeout { port, .. }
            | TunnelError::Io { port, .. } => Some(*port),
            TunnelError::Spawn { .. } => None,
        }
    }
}
