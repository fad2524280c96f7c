//! Resource handles and their state machine

use std::fmt;

use super::ResourceError;
use crate::portforward::TunnelSpec;

/// Kinds of resource a run provisions, in dependency order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    SecretRef,
    ClusterBinding,
    FirewallRule,
    PortForwardTunnel,
}

impl ResourceKind {
    /// All kinds, earliest stage first
    pub fn all() -> [ResourceKind; 4] {
        [
            ResourceKind::SecretRef,
            ResourceKind::ClusterBinding,
            ResourceKind::FirewallRule,
            ResourceKind::PortForwardTunnel,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::SecretRef => "secret-ref",
            ResourceKind::ClusterBinding => "cluster-binding",
            ResourceKind::FirewallRule => "firewall-rule",
            ResourceKind::PortForwardTunnel => "port-forward-tunnel",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transition a failed resource was in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailedPhase {
    Create,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreationState {
    Absent,
    Creating,
    Present,
    Deleting,
    Failed(FailedPhase),
}

impl CreationState {
    pub fn can_advance_to(self, next: CreationState) -> bool {
        use CreationState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Present)
                | (Creating, Failed(FailedPhase::Create))
                | (Present, Deleting)
                | (Deleting, Absent)
                | (Deleting, Failed(FailedPhase::Delete))
                | (Failed(FailedPhase::Delete), Deleting)
        )
    }

    /// Whether teardown has anything to delete
    pub fn needs_teardown(self) -> bool {
        matches!(
            self,
            CreationState::Present | CreationState::Failed(FailedPhase::Delete)
        )
    }
}

impl fmt::Display for CreationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationState::Absent => write!(f, "absent"),
            CreationState::Creating => write!(f, "creating"),
            CreationState::Present => write!(f, "present"),
            CreationState::Deleting => write!(f, "deleting"),
            CreationState::Failed(FailedPhase::Create) => write!(f, "failed (create)"),
            CreationState::Failed(FailedPhase::Delete) => write!(f, "failed (delete)"),
        }
    }
}

/// Kind-specific parameters of a resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceParams {
    /// Workload identity binding letting a Kubernetes service account act as
    /// a GCP service account
    SecretAccess {
        project: String,
        service_account: String,
        member: String,
    },
    /// Namespace the test app of one role runs in
    ClusterBinding {
        context: Option<String>,
        namespace: String,
    },
    FirewallRule {
        project: String,
        network: String,
        source_ranges: Vec<String>,
        allowed_ports: Vec<String>,
    },
    PortForward(TunnelSpec),
}

impl ResourceParams {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceParams::SecretAccess { .. } => ResourceKind::SecretRef,
            ResourceParams::ClusterBinding { .. } => ResourceKind::ClusterBinding,
            ResourceParams::FirewallRule { .. } => ResourceKind::FirewallRule,
            ResourceParams::PortForward(_) => ResourceKind::PortForwardTunnel,
        }
    }
}

/// What to create: a name plus kind-specific parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub params: ResourceParams,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, params: ResourceParams) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.params.kind()
    }
}

/// One resource of a run and where it is in its lifecycle
#[derive(Clone, Debug)]
pub struct ResourceHandle {
    spec: ResourceSpec,
    state: CreationState,
    adopted: bool,
    last_error: Option<String>,
}

impl ResourceHandle {
    pub fn new(spec: ResourceSpec) -> Self {
        Self {
            spec,
            state: CreationState::Absent,
            adopted: false,
            last_error: None,
        }
    }

    /// Handle for a resource a previous run may have left behind
    ///
    /// Starts out present so teardown acts on it; deleting a resource that
    /// does not exist succeeds.
    pub fn recovered(spec: ResourceSpec) -> Self {
        Self {
            spec,
            state: CreationState::Present,
            adopted: true,
            last_error: None,
        }
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> CreationState {
        self.state
    }

    /// Existed before this run created it
    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn advance(&mut self, next: CreationState) -> Result<(), ResourceError> {
        if !self.state.can_advance_to(next) {
            return Err(ResourceError::InvalidTransition {
                name: self.spec.name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn mark_adopted(&mut self) {
        self.adopted = true;
    }

    pub(crate) fn fail(&mut self, phase: FailedPhase, reason: impl Into<String>) {
        self.state = CreationState::Failed(phase);
        self.last_error = Some(reason.into());
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.kind(), self.spec.name, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str) -> ResourceSpec {
        ResourceSpec::new(
            name,
            ResourceParams::ClusterBinding {
                context: None,
                namespace: name.to_string(),
            },
        )
    }

    #[test]
    fn test_kind_order_matches_dependencies() {
        let kinds = ResourceKind::all();
        let mut sorted = kinds;
        sorted.sort();
        assert_eq!(kinds, sorted);
        assert_eq!(kinds[0], ResourceKind::SecretRef);
        assert_eq!(kinds[3], ResourceKind::PortForwardTunnel);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut handle = ResourceHandle::new(binding("a-server-r1"));
        assert_eq!(handle.state(), CreationState::Absent);

        handle.advance(CreationState::Creating).unwrap();
        handle.advance(CreationState::Present).unwrap();
        handle.advance(CreationState::Deleting).unwrap();
        handle.advance(CreationState::Absent).unwrap();
        assert_eq!(handle.state(), CreationState::Absent);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut handle = ResourceHandle::new(binding("a-server-r1"));
        let err = handle.advance(CreationState::Present).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidTransition { .. }));
        assert_eq!(handle.state(), CreationState::Absent);

        assert!(!CreationState::Absent.can_advance_to(CreationState::Deleting));
        assert!(!CreationState::Failed(FailedPhase::Create).can_advance_to(CreationState::Deleting));
        assert!(CreationState::Failed(FailedPhase::Delete).can_advance_to(CreationState::Deleting));
    }

    #[test]
    fn test_needs_teardown() {
        assert!(CreationState::Present.needs_teardown());
        assert!(CreationState::Failed(FailedPhase::Delete).needs_teardown());
        assert!(!CreationState::Absent.needs_teardown());
        assert!(!CreationState::Failed(FailedPhase::Create).needs_teardown());
    }

    #[test]
    fn test_recovered_handle_is_present() {
        let handle = ResourceHandle::recovered(binding("a-client-r1"));
        assert_eq!(handle.state(), CreationState::Present);
        assert!(handle.is_adopted());
        assert_eq!(handle.to_string(), "cluster-binding a-client-r1 [present]");
    }
}
