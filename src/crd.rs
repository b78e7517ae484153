//! `DataPlane`, `TenantInfra` and `Tenant` CRD type definitions.

pub mod spec;
pub mod status;
pub mod tenant;
pub mod types;

pub use spec::{
    ApplicationSpec, ChartSpec, ClusterSpec, DataPlane, DataPlaneSpec, MachinePoolSpec,
    NetworkSpec, SystemPoolSpec,
};
pub use status::{CloudInfraStatus, Condition, DataPlaneStatus, EksStatus};
pub use tenant::{
    Tenant, TenantInfra, TenantInfraPhase, TenantInfraSpec, TenantInfraStatus, TenantPhase,
    TenantSpec, TenantStatus,
};
pub use types::{AppPhase, CloudKind, DataPlanePhase, NetworkMode, PhaseEvent};
