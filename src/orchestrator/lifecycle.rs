//! Provisioning and teardown sequencing
//!
//! Stages run in dependency order, one after the other; resources inside a
//! stage do not depend on each other and are created concurrently. The first
//! stage with a failure halts provisioning. Teardown walks the handles in
//! reverse creation order and only touches resources that are present.

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    CreateOutcome, CreationState, FailedPhase, ProvisionPlan, ResourceBackend, ResourceError,
    ResourceHandle, ResourceKind, ResourceParams, ResourceSpec, TeardownFailure,
};
use crate::config::DriverSettings;
use crate::portforward::{PortForwardManager, TunnelError};
use crate::utils::{Stopwatch, Timer};

/// Retry policy for deletions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownPolicy {
    pub attempts: u32,
    pub retry_wait: Duration,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OrchestratorOptions {
    /// Tear down what was created when provisioning fails
    pub rollback_on_failure: bool,
    /// Treat an existing namespace as ours instead of a name collision
    pub adopt_existing: bool,
    pub teardown: TeardownPolicy,
}

impl OrchestratorOptions {
    pub fn from_settings(settings: &DriverSettings) -> Self {
        Self {
            rollback_on_failure: settings.rollback_on_failure,
            adopt_existing: settings.resource_suffix.is_pinned(),
            teardown: TeardownPolicy {
                attempts: settings.teardown_attempts.max(1),
                retry_wait: settings.teardown_retry_wait,
            },
        }
    }
}

/// Result of a provisioning pass that was not cancelled
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    present: Vec<ResourceHandle>,
    failed: Vec<ResourceHandle>,
    failures: Vec<ResourceError>,
    rolled_back: bool,
}

impl ProvisionOutcome {
    /// Handles that are present after provisioning
    pub fn present(&self) -> &[ResourceHandle] {
        &self.present
    }

    /// Handles whose creation failed
    pub fn failed(&self) -> &[ResourceHandle] {
        &self.failed
    }

    pub fn into_failures(self) -> Vec<ResourceError> {
        self.failures
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }
}

/// What a teardown pass did
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub skipped: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<Self, ResourceError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ResourceError::TeardownFailed {
                failures: self.failures,
            })
        }
    }
}

/// Results of one stage, by handle index
///
/// A cancelled stage still carries every result that arrived before the
/// token fired; those resources exist and must be settled.
#[derive(Default)]
struct StageResult {
    settled: Vec<(usize, Result<CreateOutcome, ResourceError>)>,
    cancelled: bool,
}

/// Owns every resource handle and tunnel of one run
pub struct ResourceLifecycleOrchestrator {
    backend: Arc<dyn ResourceBackend>,
    tunnels: PortForwardManager,
    handles: Vec<ResourceHandle>,
    options: OrchestratorOptions,
}

impl ResourceLifecycleOrchestrator {
    pub fn new(backend: Arc<dyn ResourceBackend>, tunnels: PortForwardManager) -> Self {
        Self {
            backend,
            tunnels,
            handles: Vec::new(),
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tunnels(&self) -> &PortForwardManager {
        &self.tunnels
    }

    /// Create the resources of `plan` stage by stage
    ///
    /// Stops after the first stage with a failure and returns the partial
    /// result; resources of later stages are never instantiated. Returns
    /// `Cancelled` once `cancel` fires, after tearing down what is present.
    pub async fn provision(
        &mut self,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ResourceError> {
        info!("Provisioning {} resource(s)", plan.len());
        let mut stopwatch = Stopwatch::new();
        let mut failures = Vec::new();

        for (kind, specs) in plan.stages() {
            if cancel.is_cancelled() {
                return Err(self.abort().await);
            }

            let start = self.handles.len();
            for spec in specs {
                let mut handle = ResourceHandle::new(spec.clone());
                handle.advance(CreationState::Creating)?;
                debug!(kind = %kind, name = %handle.name(), "Creating");
                self.handles.push(handle);
            }

            let stage = match kind {
                ResourceKind::PortForwardTunnel => self.open_tunnels(start, cancel).await,
                _ => self.create_stage(start, cancel).await,
            };
            for (idx, result) in stage.settled {
                if let Some(err) = self.settle(idx, result)? {
                    failures.push(err);
                }
            }
            if stage.cancelled {
                return Err(self.abort().await);
            }
            stopwatch.lap(kind.as_str());

            if !failures.is_empty() {
                warn!("Stage {} failed, not provisioning further resources", kind);
                break;
            }
        }
        info!("Provisioning took {}", stopwatch);

        let mut rolled_back = false;
        let rollback = self.options.rollback_on_failure
            && failures
                .iter()
                .any(|e| !matches!(e, ResourceError::Tunnel { .. }));
        if rollback {
            info!("Rolling back partially provisioned resources");
            let report = self.teardown().await;
            rolled_back = true;
            if !report.is_clean() {
                failures.push(ResourceError::TeardownFailed {
                    failures: report.failures,
                });
            }
        }

        Ok(self.outcome(failures, rolled_back))
    }

    /// Delete every present resource, newest first
    ///
    /// Safe to call repeatedly; absent handles are skipped and handles whose
    /// deletion failed are retried.
    pub async fn teardown(&mut self) -> TeardownReport {
        let timer = Timer::start("teardown");
        let mut report = TeardownReport::default();

        for idx in (0..self.handles.len()).rev() {
            if !self.handles[idx].state().needs_teardown() {
                report.skipped += 1;
                continue;
            }
            if let Err(e) = self.handles[idx].advance(CreationState::Deleting) {
                warn!("{}", e);
                report.skipped += 1;
                continue;
            }

            let spec = self.handles[idx].spec().clone();
            match self.delete_with_retry(&spec).await {
                Ok(()) => {
                    if let Err(e) = self.handles[idx].advance(CreationState::Absent) {
                        warn!("{}", e);
                    }
                    report.deleted.push(spec.name);
                }
                Err(reason) => {
                    error!("Giving up on {} {}: {}", spec.kind(), spec.name, reason);
                    self.handles[idx].fail(FailedPhase::Delete, reason.clone());
                    report.failures.push(TeardownFailure {
                        kind: spec.kind(),
                        name: spec.name,
                        reason,
                    });
                }
            }
        }

        info!(
            "Teardown finished in {}ms: {} deleted, {} skipped, {} failed",
            timer.stop().as_millis(),
            report.deleted.len(),
            report.skipped,
            report.failures.len()
        );
        report
    }

    /// Close every tunnel, then tear down
    pub async fn shutdown(&mut self) -> TeardownReport {
        let closed = self.tunnels.close_all().await;
        if closed > 0 {
            info!("Closed {} port-forward tunnel(s)", closed);
        }
        self.teardown().await
    }

    /// Track resources a previous run of the same name group may have left
    ///
    /// Tunnels are skipped since they die with the process that owned them.
    pub fn recover(&mut self, plan: &ProvisionPlan) -> usize {
        let mut recovered = 0;
        for (kind, specs) in plan.stages() {
            if kind == ResourceKind::PortForwardTunnel {
                continue;
            }
            for spec in specs {
                self.handles.push(ResourceHandle::recovered(spec.clone()));
                recovered += 1;
            }
        }
        recovered
    }

    /// Report tunnels whose process died; they are not restarted
    pub fn check_tunnels(&mut self) -> Vec<TunnelError> {
        self.tunnels.check_health()
    }

    /// Create every handle from `start` on concurrently
    ///
    /// Results are collected as they arrive. On cancellation, creates still
    /// in flight are dropped but finished ones are kept.
    async fn create_stage(&self, start: usize, cancel: &CancellationToken) -> StageResult {
        let mut pending: FuturesUnordered<_> = self.handles[start..]
            .iter()
            .enumerate()
            .map(|(offset, handle)| {
                let backend = Arc::clone(&self.backend);
                let spec = handle.spec().clone();
                async move {
                    let result = backend
                        .create(&spec)
                        .await
                        .map_err(|e| ResourceError::CreateFailed {
                            kind: spec.kind(),
                            name: spec.name.clone(),
                            reason: format!("{e:#}"),
                        });
                    (start + offset, result)
                }
            })
            .collect();

        let mut stage = StageResult::default();
        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some(settled) => stage.settled.push(settled),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Some(Some(settled)) = pending.next().now_or_never() {
                        stage.settled.push(settled);
                    }
                    debug!("Dropping {} create(s) still in flight", pending.len());
                    stage.cancelled = true;
                    break;
                }
            }
        }
        stage
    }

    async fn open_tunnels(&mut self, start: usize, cancel: &CancellationToken) -> StageResult {
        let mut stage = StageResult::default();

        for idx in start..self.handles.len() {
            let name = self.handles[idx].name().to_string();
            let spec = match &self.handles[idx].spec().params {
                ResourceParams::PortForward(spec) => spec.clone(),
                _ => {
                    let err = ResourceError::CreateFailed {
                        kind: self.handles[idx].kind(),
                        name,
                        reason: "not a port-forward tunnel".to_string(),
                    };
                    stage.settled.push((idx, Err(err)));
                    continue;
                }
            };

            let opened = tokio::select! {
                opened = self.tunnels.open_tunnel(spec) => opened.map(|_| CreateOutcome::Created),
                _ = cancel.cancelled() => {
                    stage.cancelled = true;
                    break;
                }
            };
            stage
                .settled
                .push((idx, opened.map_err(|source| ResourceError::Tunnel { name, source })));
        }

        stage
    }

    /// Apply a creation result to its handle; returns the failure, if any
    fn settle(
        &mut self,
        idx: usize,
        result: Result<CreateOutcome, ResourceError>,
    ) -> Result<Option<ResourceError>, ResourceError> {
        let adopt_existing = self.options.adopt_existing;
        let handle = &mut self.handles[idx];

        match result {
            Ok(CreateOutcome::Created) => {
                handle.advance(CreationState::Present)?;
                info!(kind = %handle.kind(), name = %handle.name(), "Created");
                Ok(None)
            }
            Ok(CreateOutcome::Adopted)
                if handle.kind() == ResourceKind::ClusterBinding && !adopt_existing =>
            {
                let err = ResourceError::NameCollision {
                    kind: handle.kind(),
                    name: handle.name().to_string(),
                };
                error!("{}", err);
                handle.fail(FailedPhase::Create, err.to_string());
                Ok(Some(err))
            }
            Ok(CreateOutcome::Adopted) => {
                handle.advance(CreationState::Present)?;
                handle.mark_adopted();
                info!(kind = %handle.kind(), name = %handle.name(), "Adopted existing resource");
                Ok(None)
            }
            Err(err) => {
                error!("{}", err);
                handle.fail(FailedPhase::Create, err.to_string());
                Ok(Some(err))
            }
        }
    }

    async fn delete_with_retry(&mut self, spec: &ResourceSpec) -> Result<(), String> {
        if let ResourceParams::PortForward(tunnel) = &spec.params {
            if !self.tunnels.close(tunnel.local_port).await {
                debug!("Port-forward {} was already closed", tunnel);
            }
            return Ok(());
        }

        let attempts = self.options.teardown.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.backend.delete(spec).await {
                Ok(()) => {
                    info!(kind = %spec.kind(), name = %spec.name, "Deleted");
                    return Ok(());
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(
                        "Deleting {} {} failed (attempt {}/{}): {}",
                        spec.kind(),
                        spec.name,
                        attempt,
                        attempts,
                        last_error
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.options.teardown.retry_wait).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn abort(&mut self) -> ResourceError {
        warn!("Provisioning cancelled, tearing down present resources");
        for handle in self
            .handles
            .iter_mut()
            .filter(|h| h.state() == CreationState::Creating)
        {
            handle.fail(FailedPhase::Create, "cancelled");
        }

        let report = self.shutdown().await;
        ResourceError::Cancelled {
            torn_down: report.deleted.len(),
            failed: report.failures.len(),
        }
    }

    fn outcome(&self, failures: Vec<ResourceError>, rolled_back: bool) -> ProvisionOutcome {
        let (present, failed): (Vec<ResourceHandle>, Vec<ResourceHandle>) = self
            .handles
            .iter()
            .filter(|h| {
                matches!(
                    h.state(),
                    CreationState::Present | CreationState::Failed(FailedPhase::Create)
                )
            })
            .cloned()
            .partition(|h| h.state() == CreationState::Present);

        ProvisionOutcome {
            present,
            failed,
            failures,
            rolled_back,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, ConfigSource, FlagRegistry, SourceOrigin};
    use crate::naming::ResourceNamer;
    use crate::portforward::{KubectlLauncher, TunnelSpec};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory backend with scripted failures
    #[derive(Default)]
    struct ScriptedBackend {
        fail_create: HashSet<String>,
        existing: HashSet<String>,
        hang_create: HashSet<String>,
        delete_failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn failing_create(mut self, name: &str) -> Self {
            self.fail_create.insert(name.to_string());
            self
        }

        fn existing(mut self, name: &str) -> Self {
            self.existing.insert(name.to_string());
            self
        }

        fn hanging_create(mut self, name: &str) -> Self {
            self.hang_create.insert(name.to_string());
            self
        }

        fn failing_delete(self, name: &str, times: u32) -> Self {
            self.delete_failures
                .lock()
                .unwrap()
                .insert(name.to_string(), times);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceBackend for ScriptedBackend {
        async fn create(&self, spec: &ResourceSpec) -> anyhow::Result<CreateOutcome> {
            self.calls.lock().unwrap().push(format!("create:{}", spec.name));
            if self.hang_create.contains(&spec.name) {
                std::future::pending::<()>().await;
            }
            if self.fail_create.contains(&spec.name) {
                bail!("quota exceeded");
            }
            if self.existing.contains(&spec.name) {
                return Ok(CreateOutcome::Adopted);
            }
            Ok(CreateOutcome::Created)
        }

        async fn delete(&self, spec: &ResourceSpec) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{}", spec.name));
            let mut failures = self.delete_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&spec.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    bail!("backend unavailable");
                }
            }
            Ok(())
        }
    }

    fn secret(name: &str) -> ResourceSpec {
        ResourceSpec::new(
            name,
            ResourceParams::SecretAccess {
                project: "p".to_string(),
                service_account: "sa@p".to_string(),
                member: format!("serviceAccount:p.svc.id.goog[{name}]"),
            },
        )
    }

    fn namespace(name: &str) -> ResourceSpec {
        ResourceSpec::new(
            name,
            ResourceParams::ClusterBinding {
                context: None,
                namespace: name.to_string(),
            },
        )
    }

    fn firewall(name: &str) -> ResourceSpec {
        ResourceSpec::new(
            name,
            ResourceParams::FirewallRule {
                project: "p".to_string(),
                network: "default".to_string(),
                source_ranges: vec!["35.191.0.0/16".to_string()],
                allowed_ports: vec!["8080-8100".to_string()],
            },
        )
    }

    fn three_stage_plan() -> ProvisionPlan {
        ProvisionPlan::new()
            .with(secret("sa-binding"))
            .with(namespace("alice-server-r1"))
            .with(firewall("alice-allow-health-checks-r1"))
    }

    fn options() -> OrchestratorOptions {
        OrchestratorOptions {
            rollback_on_failure: false,
            adopt_existing: false,
            teardown: TeardownPolicy {
                attempts: 3,
                retry_wait: Duration::ZERO,
            },
        }
    }

    fn orchestrator(backend: &Arc<ScriptedBackend>) -> ResourceLifecycleOrchestrator {
        let backend: Arc<dyn ResourceBackend> = backend.clone();
        ResourceLifecycleOrchestrator::new(backend, PortForwardManager::new(KubectlLauncher::default()))
            .with_options(options())
    }

    #[tokio::test]
    async fn test_failure_on_second_of_three_halts() {
        let backend = Arc::new(ScriptedBackend::default().failing_create("alice-server-r1"));
        let mut orch = orchestrator(&backend);

        let outcome = orch
            .provision(&three_stage_plan(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.present().len(), 1);
        assert_eq!(outcome.present()[0].name(), "sa-binding");
        assert_eq!(outcome.present()[0].state(), CreationState::Present);
        assert_eq!(outcome.failed().len(), 1);
        assert!(matches!(
            &outcome.failures[0],
            ResourceError::CreateFailed { name, .. } if name == "alice-server-r1"
        ));
        assert!(!outcome.rolled_back());

        // The firewall rule was never attempted
        assert_eq!(backend.calls(), vec!["create:sa-binding", "create:alice-server-r1"]);
        assert_eq!(orch.handles.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_when_configured() {
        let backend = Arc::new(ScriptedBackend::default().failing_create("alice-server-r1"));
        let mut orch = orchestrator(&backend).with_options(OrchestratorOptions {
            rollback_on_failure: true,
            ..options()
        });

        let outcome = orch
            .provision(&three_stage_plan(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.rolled_back());
        assert!(outcome.present().is_empty());
        assert!(backend.calls().contains(&"delete:sa-binding".to_string()));
        assert!(!backend.calls().contains(&"delete:alice-server-r1".to_string()));
        assert_eq!(orch.handles[0].state(), CreationState::Absent);
    }

    #[test]
    fn test_teardown_is_idempotent_and_reversed() {
        tokio_test::block_on(async {
            let backend = Arc::new(ScriptedBackend::default());
            let mut orch = orchestrator(&backend);

            let outcome = orch
                .provision(&three_stage_plan(), &CancellationToken::new())
                .await
                .unwrap();
            assert!(outcome.is_complete());
            assert_eq!(outcome.present().len(), 3);

            let first = orch.teardown().await;
            assert!(first.is_clean());
            assert_eq!(
                first.deleted,
                vec!["alice-allow-health-checks-r1", "alice-server-r1", "sa-binding"]
            );

            let second = orch.teardown().await;
            assert!(second.is_clean());
            assert!(second.deleted.is_empty());
            assert_eq!(second.skipped, 3);
            assert!(second.into_result().is_ok());
            assert!(orch
                .handles
                .iter()
                .all(|h| h.state() == CreationState::Absent));
        });
    }

    #[tokio::test]
    async fn test_teardown_retries_then_reports() {
        let backend = Arc::new(ScriptedBackend::default().failing_delete("alice-server-r1", 4));
        let mut orch = orchestrator(&backend);
        orch.provision(&three_stage_plan(), &CancellationToken::new())
            .await
            .unwrap();

        let report = orch.teardown().await;
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "alice-server-r1");
        assert_eq!(
            orch.handles[1].state(),
            CreationState::Failed(FailedPhase::Delete)
        );
        let deletes = backend
            .calls()
            .iter()
            .filter(|c| *c == "delete:alice-server-r1")
            .count();
        assert_eq!(deletes, 3);
        assert!(matches!(
            report.into_result(),
            Err(ResourceError::TeardownFailed { failures }) if failures.len() == 1
        ));

        // One failure left, which the next pass retries through
        let retry = orch.teardown().await;
        assert!(retry.is_clean());
        assert_eq!(retry.deleted, vec!["alice-server-r1"]);
        assert_eq!(orch.handles[1].state(), CreationState::Absent);
    }

    #[tokio::test]
    async fn test_unrequested_firewall_is_never_instantiated() {
        let source = ConfigSource::parse(
            SourceOrigin::CommandLine,
            "--resource_prefix=alice\n--resource_suffix=r2\n--noensure_firewall",
        )
        .unwrap();
        let config = ConfigResolver::new(FlagRegistry::driver())
            .resolve_source(&source)
            .unwrap();
        let settings = DriverSettings::from_config(&config).unwrap();
        let namer = ResourceNamer::new(&settings.name_template()).unwrap();
        let plan = ProvisionPlan::from_settings(&settings, &namer);

        let backend = Arc::new(ScriptedBackend::default());
        let mut orch = orchestrator(&backend);
        let outcome = orch.provision(&plan, &CancellationToken::new()).await.unwrap();

        assert!(outcome.is_complete());
        assert!(!outcome.present().is_empty());
        assert!(outcome
            .present()
            .iter()
            .all(|h| h.kind() != ResourceKind::FirewallRule));
        assert!(orch
            .handles
            .iter()
            .all(|h| h.kind() != ResourceKind::FirewallRule));
    }

    #[tokio::test]
    async fn test_existing_namespace_is_a_collision() {
        let backend = Arc::new(ScriptedBackend::default().existing("alice-server-r1"));
        let mut orch = orchestrator(&backend);

        let outcome = orch
            .provision(&three_stage_plan(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            &outcome.failures[0],
            ResourceError::NameCollision { kind: ResourceKind::ClusterBinding, .. }
        ));
        orch.teardown().await;
        assert!(!backend.calls().contains(&"delete:alice-server-r1".to_string()));
    }

    #[tokio::test]
    async fn test_existing_resources_adopted() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .existing("alice-server-r1")
                .existing("alice-allow-health-checks-r1"),
        );
        let mut orch = orchestrator(&backend).with_options(OrchestratorOptions {
            adopt_existing: true,
            ..options()
        });

        let outcome = orch
            .provision(&three_stage_plan(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_complete());
        let adopted: Vec<&str> = outcome
            .present()
            .iter()
            .filter(|h| h.is_adopted())
            .map(|h| h.name())
            .collect();
        assert_eq!(adopted, vec!["alice-server-r1", "alice-allow-health-checks-r1"]);
    }

    #[tokio::test]
    async fn test_cancel_during_provisioning() {
        let backend = Arc::new(ScriptedBackend::default().hanging_create("alice-server-r1"));
        let mut orch = orchestrator(&backend);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = orch.provision(&three_stage_plan(), &cancel).await.unwrap_err();

        assert!(matches!(err, ResourceError::Cancelled { torn_down: 1, failed: 0 }));
        assert_eq!(orch.handles[0].state(), CreationState::Absent);
        assert_eq!(
            orch.handles[1].state(),
            CreationState::Failed(FailedPhase::Create)
        );
        assert_eq!(orch.handles[1].last_error(), Some("cancelled"));
        assert!(backend.calls().contains(&"delete:sa-binding".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_keeps_and_deletes_finished_creates_of_a_stage() {
        let backend = Arc::new(ScriptedBackend::default().hanging_create("alice-client-r1"));
        let mut orch = orchestrator(&backend);
        let plan = ProvisionPlan::new()
            .with(namespace("alice-server-r1"))
            .with(namespace("alice-client-r1"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = orch.provision(&plan, &cancel).await.unwrap_err();

        assert!(matches!(err, ResourceError::Cancelled { torn_down: 1, failed: 0 }));
        let calls = backend.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], "delete:alice-server-r1");
        assert!(!calls.contains(&"delete:alice-client-r1".to_string()));
        assert_eq!(orch.handles[0].state(), CreationState::Absent);
        assert_eq!(
            orch.handles[1].state(),
            CreationState::Failed(FailedPhase::Create)
        );
        assert_eq!(orch.handles[1].last_error(), Some("cancelled"));

        // Nothing is left for a later pass
        let again = orch.teardown().await;
        assert!(again.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_touches_nothing() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut orch = orchestrator(&backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.provision(&three_stage_plan(), &cancel).await.unwrap_err();
        assert!(matches!(err, ResourceError::Cancelled { torn_down: 0, .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_failure_does_not_roll_back() {
        let backend = Arc::new(ScriptedBackend::default());
        let backend_dyn: Arc<dyn ResourceBackend> = backend.clone();
        let mut orch = ResourceLifecycleOrchestrator::new(
            backend_dyn,
            PortForwardManager::new(KubectlLauncher::new("/nonexistent/kubectl")),
        )
        .with_options(OrchestratorOptions {
            rollback_on_failure: true,
            ..options()
        });

        let tunnel = TunnelSpec::new(18090, 8080, "alice-server-r1", "deployment/psm-grpc-server");
        let plan = three_stage_plan().with(ResourceSpec::new(
            "alice-server-port-forward-r1",
            ResourceParams::PortForward(tunnel),
        ));

        let outcome = orch.provision(&plan, &CancellationToken::new()).await.unwrap();

        assert!(matches!(&outcome.failures[0], ResourceError::Tunnel { .. }));
        assert!(!outcome.rolled_back());
        assert_eq!(outcome.present().len(), 3);
        assert!(orch.tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_recover_tears_down_by_name() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut orch = orchestrator(&backend);

        let tunnel = TunnelSpec::new(18091, 8080, "ns", "deployment/app");
        let plan = three_stage_plan().with(ResourceSpec::new("pf", ResourceParams::PortForward(tunnel)));
        assert_eq!(orch.recover(&plan), 3);

        let report = orch.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(
            backend.calls(),
            vec![
                "delete:alice-allow-health-checks-r1",
                "delete:alice-server-r1",
                "delete:sa-binding"
            ]
        );
    }
}
