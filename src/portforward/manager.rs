//! Tunnel supervision

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::{TunnelError, TunnelLauncher, TunnelSpec};

/// How long to wait for the ready marker after spawning
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// An open tunnel and its backing process
#[derive(Debug)]
pub struct Tunnel {
    spec: TunnelSpec,
    child: Child,
    opened_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.opened_at
    }

    async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Already reaped
            debug!("Port-forward on {} already stopped: {}", self.spec.local_port, e);
        }
    }
}

/// Owns every tunnel of a run, at most one per local port
pub struct PortForwardManager {
    launcher: Box<dyn TunnelLauncher>,
    tunnels: BTreeMap<u16, Tunnel>,
    startup_timeout: Duration,
}

impl PortForwardManager {
    pub fn new(launcher: impl TunnelLauncher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            tunnels: BTreeMap::new(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Open a tunnel; fails with `PortInUse` if the local port is taken
    pub async fn open_tunnel(&mut self, spec: TunnelSpec) -> Result<&Tunnel, TunnelError> {
        let port = spec.local_port;
        if let Some(existing) = self.tunnels.get(&port) {
            return Err(TunnelError::PortInUse {
                port,
                existing: existing.spec.to_string(),
            });
        }

        debug!("Opening port-forward {}", spec);
        let mut child = self
            .launcher
            .command(&spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                spec: spec.to_string(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, port));
        }

        if let Some(marker) = self.launcher.ready_marker() {
            if let Err(e) = wait_ready(&mut child, port, marker, self.startup_timeout).await {
                let _ = child.kill().await;
                return Err(e);
            }
        } else if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, port));
        }

        info!("Port-forward open: {} (pid {:?})", spec, child.id());
        let tunnel = Tunnel {
            spec,
            child,
            opened_at: Utc::now(),
        };
        Ok(self.tunnels.entry(port).or_insert(tunnel))
    }

    /// Close the tunnel on `local_port`; returns whether one was open
    pub async fn close(&mut self, local_port: u16) -> bool {
        match self.tunnels.remove(&local_port) {
            Some(mut tunnel) => {
                tunnel.stop().await;
                info!("Port-forward closed: {}", tunnel.spec);
                true
            }
            None => false,
        }
    }

    /// Close every tunnel; returns how many were open
    pub async fn close_all(&mut self) -> usize {
        let ports: Vec<u16> = self.tunnels.keys().copied().collect();
        let mut closed = 0;
        for port in ports {
            if self.close(port).await {
                closed += 1;
            }
        }
        closed
    }

    /// Detect tunnels whose process has exited
    ///
    /// Dead tunnels are reported and dropped so their port can be reopened;
    /// they are never restarted here.
    pub fn check_health(&mut self) -> Vec<TunnelError> {
        let mut dead = Vec::new();
        for (port, tunnel) in self.tunnels.iter_mut() {
            match tunnel.child.try_wait() {
                Ok(Some(status)) => dead.push(TunnelError::ProcessExited {
                    port: *port,
                    status: status.to_string(),
                }),
                Ok(None) => {}
                Err(source) => dead.push(TunnelError::Io { port: *port, source }),
            }
        }

        for err in &dead {
            if let Some(tunnel) = err.port().and_then(|port| self.tunnels.remove(&port)) {
                warn!(
                    "Port-forward {} went down after {}s: {}",
                    tunnel.spec,
                    tunnel.uptime().num_seconds(),
                    err
                );
            }
        }
        dead
    }

    /// Open tunnels by local port
    pub fn iter(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Drop for PortForwardManager {
    fn drop(&mut self) {
        for tunnel in self.tunnels.values_mut() {
            if tunnel.child.start_kill().is_ok() {
                debug!("Killed port-forward on {} at drop", tunnel.spec.local_port);
            }
        }
    }
}

/// Read stdout until `marker`, then keep draining it in the background
async fn wait_ready(
    child: &mut Child,
    port: u16,
    marker: &str,
    timeout: Duration,
) -> Result<(), TunnelError> {
    let Some(stdout) = child.stdout.take() else {
        return Ok(());
    };
    let mut lines = BufReader::new(stdout).lines();

    let found = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.next_line().await? {
            debug!("[port-forward {}] {}", port, line);
            if line.contains(marker) {
                return Ok(true);
            }
        }
        Ok::<bool, std::io::Error>(false)
    })
    .await;

    match found {
        Ok(Ok(true)) => {
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[port-forward {}] {}", port, line);
                }
            });
            Ok(())
        }
        Ok(Ok(false)) => {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            Err(TunnelError::ProcessExited { port, status })
        }
        Ok(Err(source)) => Err(TunnelError::Io { port, source }),
        Err(_) => Err(TunnelError::StartupTimeout { port, timeout }),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: R, port: u16) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[port-forward {}] {}", port, line);
    }
}
