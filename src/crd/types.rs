//! Enum types for dataplane phases, cloud kinds and workload deployment states.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a `DataPlane`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DataPlanePhase {
    #[default]
    Pending,
    Creating,
    Active,
    Updating,
    Failed,
    Terminating,
}

/// Inputs that move a `DataPlane` between phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    /// A create call for some component was accepted, or components are still converging.
    Provisioning,
    /// The control plane version update was requested or is still running.
    UpgradeStarted,
    /// Every node pool and add-on reports the provider's terminal-active value.
    ComponentsReady,
    /// A component returned an error during this pass.
    Errored,
    /// A deletion timestamp was observed.
    DeletionRequested,
}

impl DataPlanePhase {
    /// Transition function for the phase state machine.
    ///
    /// `Terminating` is absorbing: once teardown starts nothing moves the record back.
    #[must_use]
    pub const fn next(self, event: PhaseEvent) -> Self {
        match (self, event) {
            (Self::Terminating, _) | (_, PhaseEvent::DeletionRequested) => Self::Terminating,
            (_, PhaseEvent::Errored) => Self::Failed,
            (_, PhaseEvent::UpgradeStarted) => Self::Updating,
            (_, PhaseEvent::ComponentsReady) => Self::Active,
            // An in-flight version update keeps reporting Updating until it settles.
            (Self::Updating, PhaseEvent::Provisioning) => Self::Updating,
            (_, PhaseEvent::Provisioning) => Self::Creating,
        }
    }
}

impl std::fmt::Display for DataPlanePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Active => write!(f, "Active"),
            Self::Updating => write!(f, "Updating"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Supported cloud backends.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum CloudKind {
    #[default]
    Aws,
}

impl std::fmt::Display for CloudKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "Aws"),
        }
    }
}

/// How the dataplane network is obtained.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum NetworkMode {
    /// The operator creates the VPC, gateways, subnets and security group.
    #[default]
    SelfProvisioned,
    /// Subnets and security groups are supplied by the customer.
    BringYourOwn,
}

/// Deployment phase of a chart-based workload.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AppPhase {
    Installing,
    Upgrading,
    Deployed,
    Failed,
    Uninstalling,
    Uninstalled,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Installing => write!(f, "Installing"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Deployed => write!(f, "Deployed"),
            Self::Failed => write!(f, "Failed"),
            Self::Uninstalling => write!(f, "Uninstalling"),
            Self::Uninstalled => write!(f, "Uninstalled"),
        }
    }
}
