//! Test binary runner
//!
//! Runs the external test binary against the resolved configuration and
//! streams its output into the driver's log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{DriverSettings, EffectiveConfig, TestMode};
use crate::naming::ResourceNamer;
use crate::orchestrator::frontend_service_name;
use crate::utils::Timer;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to start test binary {}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for test binary")]
    Wait(#[source] std::io::Error),

    #[error("test run cancelled")]
    Cancelled,
}

/// How the test binary finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestOutcome {
    /// `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the test binary with the run's flags
pub struct TestRunner {
    binary: PathBuf,
}

impl TestRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Flags for the test binary
    ///
    /// The run's actual suffix replaces any configured one so the binary
    /// addresses the resources this run created. `--undefok=` stays last.
    pub fn build_args(
        config: &EffectiveConfig,
        settings: &DriverSettings,
        namer: &ResourceNamer,
        extra: &[String],
    ) -> Vec<String> {
        let mut args = config.to_flag_args();
        let undefok = match args.last() {
            Some(last) if last.starts_with("--undefok=") => args.pop(),
            _ => None,
        };

        args.retain(|arg| !arg.starts_with("--resource_suffix="));
        args.push(format!("--resource_suffix={}", namer.suffix()));
        if settings.mode == TestMode::Gamma {
            args.push(format!("--frontend_service_name={}", frontend_service_name(namer)));
        }
        args.extend(extra.iter().cloned());
        args.extend(undefok);
        args
    }

    /// Run to completion, or kill the binary once `cancel` fires
    pub async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<TestOutcome, ExecError> {
        info!("Running {} with {} flag(s)", self.binary.display(), args.len());
        let timer = Timer::start("test run");

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                path: self.binary.clone(),
                source,
            })?;

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(stream(out, false)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(stream(err, true)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecError::Wait)?,
            _ = cancel.cancelled() => {
                warn!("Cancelling test run");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill test binary: {}", e);
                }
                return Err(ExecError::Cancelled);
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        let outcome = TestOutcome {
            exit_code: status.code(),
            duration: timer.stop(),
        };
        if outcome.passed() {
            info!("Tests passed in {:.1}s", outcome.duration.as_secs_f64());
        } else {
            warn!("Tests failed ({}) after {:.1}s", status, outcome.duration.as_secs_f64());
        }
        Ok(outcome)
    }
}

async fn stream<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.ok().flatten() {
        if is_stderr {
            warn!("[test] {}", line);
        } else {
            info!("[test] {}", line);
        }
    }
}
